//! Volume key lifecycle: decode, fan out over the cipher engines, wipe.
//!
//! The key buffer holds `key_parts` sub-keys; trailing bytes
//! (`key_extra_size`) are reserved for IV-generator state and never reach
//! an engine. AEAD-with-HMAC engines receive the composite framed key; the
//! scratch framing is zeroised as soon as setkey returns.

use std::sync::atomic::Ordering;

use tracing::warn;
use zeroize::Zeroizing;

use common::KeyKind;

use crate::error::MapError;
use crate::mapping::MappingCore;

/// Where a key spec points.
pub(crate) enum KeySource {
    /// `-`: no key.
    None,
    Hex(String),
    Keyring { kind: KeyKind, description: String },
}

pub(crate) struct KeyState {
    pub key: Zeroizing<Vec<u8>>,
    pub key_size: usize,
    /// `type:description` of the keyring entry backing the key, kept for
    /// status output.
    pub key_string: Option<String>,
    pub key_parts: usize,
    pub key_extra_size: usize,
    pub key_mac_size: usize,
    pub tfms_count: usize,
}

impl KeyState {
    pub fn new(key_size: usize, tfms_count: usize) -> Self {
        Self {
            key: Zeroizing::new(vec![0u8; key_size]),
            key_size,
            key_string: None,
            key_parts: tfms_count,
            key_extra_size: 0,
            key_mac_size: 0,
            tfms_count,
        }
    }

    pub fn subkey_size(&self) -> usize {
        // A key too small for the IV-mode carve-out yields a zero subkey,
        // which the engines reject at setkey.
        self.key_size.saturating_sub(self.key_extra_size) / self.tfms_count
    }
}

/// Size in bytes a key spec describes, without decoding it.
pub(crate) fn key_spec_size(spec: &str) -> Result<usize, MapError> {
    if spec == "-" {
        return Ok(0);
    }
    if let Some(rest) = spec.strip_prefix(':') {
        let (size, _) = rest.split_once(':').ok_or(MapError::KeySize)?;
        return size.parse().map_err(|_| MapError::KeySize);
    }
    if spec.len() % 2 != 0 {
        return Err(MapError::KeySize);
    }
    Ok(spec.len() / 2)
}

pub(crate) fn parse_key_source(spec: &str) -> Result<KeySource, MapError> {
    if spec == "-" {
        return Ok(KeySource::None);
    }
    let Some(rest) = spec.strip_prefix(':') else {
        return Ok(KeySource::Hex(spec.to_string()));
    };

    if rest.chars().any(char::is_whitespace) {
        return Err(MapError::Key("whitespace chars not allowed in key string".into()));
    }
    let (_size, rest) = rest.split_once(':').ok_or(MapError::KeySize)?;
    let (kind, description) = rest
        .split_once(':')
        .ok_or_else(|| MapError::Key("bad keyring reference".into()))?;
    let kind =
        KeyKind::parse(kind).ok_or_else(|| MapError::Key("bad keyring key type".into()))?;
    if description.is_empty() {
        return Err(MapError::Key("empty key description".into()));
    }

    Ok(KeySource::Keyring { kind, description: description.to_string() })
}

impl MappingCore {
    /// Push the current key buffer into every engine.
    fn setkey_engines(&self) -> Result<(), MapError> {
        let key = self.key.lock().unwrap();
        if key.key_size == 0 {
            return Ok(());
        }
        let subkey_size = key.subkey_size();

        if key.key_mac_size > 0 {
            if subkey_size < key.key_mac_size {
                return Err(MapError::Key("mac key does not fit in subkey".into()));
            }
            // authenc composite: encryption sub-key first in the buffer,
            // auth sub-key after it; framed and wiped on drop.
            let enc_len = subkey_size - key.key_mac_size;
            let framed = cipher_engine::build_composite_key(
                &key.key[..enc_len],
                &key.key[enc_len..subkey_size],
            );
            let mut result = Ok(());
            for engine in &self.engines {
                if let Err(e) = engine.set_key(&framed) {
                    result = Err(MapError::Engine(e));
                }
            }
            return result;
        }

        let mut result = Ok(());
        for (i, engine) in self.engines.iter().enumerate() {
            let subkey = &key.key[i * subkey_size..(i + 1) * subkey_size];
            if let Err(e) = engine.set_key(subkey) {
                result = Err(MapError::Engine(e));
            }
        }
        result
    }

    /// Decode a key spec, install it into the engines and refresh the IV
    /// generator state. `KEY_VALID` is cleared on entry and only set again
    /// after the full cycle succeeds.
    pub(crate) fn install_key(&self, spec: &str) -> Result<(), MapError> {
        self.flags.key_valid.store(false, Ordering::SeqCst);

        match parse_key_source(spec)? {
            KeySource::None => {
                let mut key = self.key.lock().unwrap();
                if key.key_size != 0 {
                    return Err(MapError::Key("hyphen key with non-zero key size".into()));
                }
                key.key_string = None;
            }
            KeySource::Hex(hex_key) => {
                let decoded = Zeroizing::new(
                    hex::decode(&hex_key)
                        .map_err(|e| MapError::Key(format!("invalid hex key: {e}")))?,
                );
                let mut key = self.key.lock().unwrap();
                if decoded.len() != key.key_size {
                    return Err(MapError::Key(format!(
                        "key size mismatch: expected {}, got {}",
                        key.key_size,
                        decoded.len()
                    )));
                }
                key.key.copy_from_slice(&decoded);
                key.key_string = None;
            }
            KeySource::Keyring { kind, description } => {
                let payload = self.keyring.lookup(kind, &description)?;
                let mut key = self.key.lock().unwrap();
                if payload.len() != key.key_size {
                    return Err(MapError::Key(format!(
                        "keyring payload size mismatch: expected {}, got {}",
                        key.key_size,
                        payload.len()
                    )));
                }
                key.key.copy_from_slice(&payload);
                key.key_string = Some(format!("{}:{}", kind.as_str(), description));
            }
        }

        self.setkey_engines()?;
        self.init_iv()?;
        self.flags.key_valid.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Re-derive IV generator state from the installed key.
    pub(crate) fn init_iv(&self) -> Result<(), MapError> {
        let mut guard = self.iv.write().unwrap();
        let Some(iv) = guard.as_mut() else { return Ok(()) };

        // Snapshot outside the key lock; lock order is always iv before key.
        let (key_copy, subkey_size, tfms_count) = {
            let key = self.key.lock().unwrap();
            (key.key.clone(), key.subkey_size(), key.tfms_count)
        };
        let material = iv_gen::IvKeyMaterial {
            key: &key_copy,
            subkey_size,
            tfms_count,
        };
        iv.init(&material)?;
        Ok(())
    }

    /// Scrub the key: overwrite with random bytes, push the garbage into
    /// the engines so no usable schedule survives, then zero the buffer.
    pub(crate) fn wipe_key(&self) -> Result<(), MapError> {
        use rand::RngCore;

        self.flags.key_valid.store(false, Ordering::SeqCst);

        if let Some(iv) = self.iv.write().unwrap().as_mut() {
            iv.wipe()?;
        }

        {
            let mut key = self.key.lock().unwrap();
            rand::thread_rng().fill_bytes(&mut key.key);
            key.key_string = None;
        }
        let result = self.setkey_engines();
        self.key.lock().unwrap().key.fill(0);

        if let Err(e) = &result {
            warn!(error = %e, "engine rejected wipe key");
        }
        result
    }
}
