//! Bounded asynchronous wrapper around an inline engine.
//!
//! Models the completion behaviour of a driver-backed cipher queue: up to
//! `depth` requests are accepted as in-flight; beyond that the request is
//! backlogged and its callback fires twice, first `Restarted` when the
//! worker picks it up, then `Finished`. Completions run on the worker
//! thread, never on the submitter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};

use crate::{
    CipherEngine, CipherRequest, CryptOp, EngineCallback, EngineError, EngineEvent, EngineKind,
    SubmitStatus,
};

struct Job {
    op: CryptOp,
    req: CipherRequest,
    done: EngineCallback,
    backlogged: bool,
}

pub struct QueuedEngine {
    inner: Arc<dyn CipherEngine>,
    tx: Option<Sender<Job>>,
    queued: Arc<AtomicUsize>,
    depth: usize,
    worker: Option<JoinHandle<()>>,
}

impl QueuedEngine {
    /// `inner` must complete inline; the wrapper provides the asynchrony.
    pub fn new(inner: Arc<dyn CipherEngine>, depth: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let queued = Arc::new(AtomicUsize::new(0));

        let worker_inner = Arc::clone(&inner);
        let worker_queued = Arc::clone(&queued);
        let worker = std::thread::Builder::new()
            .name("cipher-queue".into())
            .spawn(move || {
                for mut job in rx {
                    if job.backlogged {
                        (job.done)(EngineEvent::Restarted);
                    }
                    let status =
                        worker_inner.process(job.op, job.req, Box::new(|_| {}));
                    worker_queued.fetch_sub(1, Ordering::AcqRel);
                    match status {
                        SubmitStatus::Completed(req, result) => {
                            (job.done)(EngineEvent::Finished(req, result));
                        }
                        // Inline engines never go async; surface the
                        // misconfiguration instead of hanging the caller.
                        _ => (job.done)(EngineEvent::Finished(
                            CipherRequest::empty(),
                            Err(EngineError::KeyNotSet),
                        )),
                    }
                }
            })
            .expect("spawn cipher queue worker");

        Self { inner, tx: Some(tx), queued, depth, worker: Some(worker) }
    }
}

impl CipherEngine for QueuedEngine {
    fn kind(&self) -> EngineKind {
        self.inner.kind()
    }

    fn iv_size(&self) -> usize {
        self.inner.iv_size()
    }

    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn set_key(&self, key: &[u8]) -> Result<(), EngineError> {
        self.inner.set_key(key)
    }

    fn set_auth_size(&self, size: usize) -> Result<(), EngineError> {
        self.inner.set_auth_size(size)
    }

    fn process(&self, op: CryptOp, req: CipherRequest, done: EngineCallback) -> SubmitStatus {
        let slot = self.queued.fetch_add(1, Ordering::AcqRel);
        let backlogged = slot >= self.depth;
        let job = Job { op, req, done, backlogged };
        self.tx
            .as_ref()
            .expect("queue live while engine exists")
            .send(job)
            .expect("worker alive while engine exists");

        if backlogged {
            SubmitStatus::Backlogged
        } else {
            SubmitStatus::InFlight
        }
    }
}

impl Drop for QueuedEngine {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CbcEngine;
    use std::sync::mpsc;

    fn engine(depth: usize) -> QueuedEngine {
        let inner = Arc::new(CbcEngine::new());
        inner.set_key(&[7u8; 32]).unwrap();
        QueuedEngine::new(inner, depth)
    }

    fn request(data: Vec<u8>) -> CipherRequest {
        CipherRequest { sector_le: [0; 8], iv: vec![0u8; 16], data, tag: Vec::new() }
    }

    #[test]
    fn completes_on_worker_thread() {
        let engine = engine(8);
        let (tx, rx) = mpsc::channel();
        let submitter = std::thread::current().id();

        let status = engine.process(
            CryptOp::Encrypt,
            request(vec![1u8; 512]),
            Box::new(move |event| {
                if let EngineEvent::Finished(req, result) = event {
                    tx.send((std::thread::current().id(), req.data.len(), result.is_ok()))
                        .unwrap();
                }
            }),
        );
        assert!(matches!(status, SubmitStatus::InFlight));

        let (thread, len, ok) = rx.recv().unwrap();
        assert_ne!(thread, submitter);
        assert_eq!(len, 512);
        assert!(ok);
    }

    #[test]
    fn zero_depth_backlogs_and_restarts_first() {
        let engine = engine(0);
        let (tx, rx) = mpsc::channel();

        let status = engine.process(
            CryptOp::Encrypt,
            request(vec![2u8; 512]),
            Box::new(move |event| match event {
                EngineEvent::Restarted => tx.send("restart").unwrap(),
                EngineEvent::Finished(_, Ok(())) => tx.send("finish").unwrap(),
                EngineEvent::Finished(_, Err(_)) => tx.send("error").unwrap(),
            }),
        );
        assert!(matches!(status, SubmitStatus::Backlogged));

        assert_eq!(rx.recv().unwrap(), "restart");
        assert_eq!(rx.recv().unwrap(), "finish");
    }

    #[test]
    fn queue_drains_in_submission_order() {
        let engine = engine(64);
        let (tx, rx) = mpsc::channel();

        for i in 0u8..16 {
            let tx = tx.clone();
            engine.process(
                CryptOp::Encrypt,
                request(vec![i; 512]),
                Box::new(move |event| {
                    if let EngineEvent::Finished(..) = event {
                        tx.send(i).unwrap();
                    }
                }),
            );
        }

        let order: Vec<u8> = (0..16).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, (0..16).collect::<Vec<u8>>());
    }
}
