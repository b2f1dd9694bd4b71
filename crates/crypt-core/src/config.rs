//! Mapping table parsing and status rendering.
//!
//! The construction line is positional:
//!
//! ```text
//! <cipher_spec> <key> <iv_offset> <device> <start> [<#opts> <opt>...]
//! ```
//!
//! Two cipher-spec grammars are accepted. The legacy form is
//! `cipher[:keycount]-chainmode-ivmode[:ivopts]`, with a bare `cipher`
//! expanding to `cipher-cbc-plain` for compatibility; the `capi:` form
//! passes the crypto API spec through verbatim and is the only way to name
//! AEAD compositions.

use common::SECTOR_SHIFT;

use crate::error::MapError;
use crate::mapping::MappingCore;

pub const MAX_FEATURE_ARGS: usize = 6;
const MAX_TAG_SIZE: usize = 480;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    pub allow_discards: bool,
    pub same_cpu_crypt: bool,
    pub submit_from_crypt_cpus: bool,
    /// `(on_disk_tag_size, profile)` where profile is `aead`, `none` or an
    /// HMAC algorithm name.
    pub integrity: Option<(usize, String)>,
    pub sector_size: Option<usize>,
    pub iv_large_sectors: bool,
}

impl Features {
    fn parse(args: &[&str]) -> Result<Self, MapError> {
        let mut features = Features::default();

        let count: usize = args
            .first()
            .ok_or(MapError::FeatureCount)?
            .parse()
            .map_err(|_| MapError::FeatureCount)?;
        if count > MAX_FEATURE_ARGS || count != args.len() - 1 {
            return Err(MapError::FeatureCount);
        }

        for opt in &args[1..] {
            if opt.eq_ignore_ascii_case("allow_discards") {
                features.allow_discards = true;
            } else if opt.eq_ignore_ascii_case("same_cpu_crypt") {
                features.same_cpu_crypt = true;
            } else if opt.eq_ignore_ascii_case("submit_from_crypt_cpus") {
                features.submit_from_crypt_cpus = true;
            } else if let Some(rest) = opt.strip_prefix("integrity:") {
                let (size, profile) = rest
                    .split_once(':')
                    .ok_or_else(|| MapError::FeatureArgs(opt.to_string()))?;
                let size: usize = size
                    .parse()
                    .map_err(|_| MapError::FeatureArgs(opt.to_string()))?;
                if size == 0 || size > MAX_TAG_SIZE {
                    return Err(MapError::FeatureArgs(opt.to_string()));
                }
                if !profile.eq_ignore_ascii_case("aead")
                    && !profile.eq_ignore_ascii_case("none")
                {
                    return Err(MapError::FeatureArgs(opt.to_string()));
                }
                features.integrity = Some((size, profile.to_ascii_lowercase()));
            } else if let Some(rest) = opt.strip_prefix("sector_size:") {
                let size: usize = rest.parse().map_err(|_| MapError::SectorSize)?;
                if size < (1 << SECTOR_SHIFT) || size > 4096 || !size.is_power_of_two() {
                    return Err(MapError::SectorSize);
                }
                features.sector_size = Some(size);
            } else if opt.eq_ignore_ascii_case("iv_large_sectors") {
                features.iv_large_sectors = true;
            } else {
                return Err(MapError::FeatureArgs(opt.to_string()));
            }
        }

        Ok(features)
    }

    pub fn integrity_aead(&self) -> bool {
        matches!(&self.integrity, Some((_, profile)) if profile == "aead")
    }
}

#[derive(Debug, Clone)]
pub struct TableArgs {
    pub cipher_spec: String,
    pub key: String,
    pub iv_offset: u64,
    pub device: String,
    pub start: u64,
    pub features: Features,
}

impl TableArgs {
    pub fn parse(line: &str) -> Result<Self, MapError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 5 {
            return Err(MapError::NotEnoughArguments);
        }

        let iv_offset: u64 = tokens[2]
            .parse()
            .map_err(|_| MapError::IvOffset)?;
        let start: u64 = tokens[4]
            .parse()
            .map_err(|_| MapError::StartSector)?;

        let features = if tokens.len() > 5 {
            Features::parse(&tokens[5..])?
        } else {
            Features::default()
        };

        Ok(Self {
            cipher_spec: tokens[0].to_string(),
            key: tokens[1].to_string(),
            iv_offset,
            device: tokens[3].to_string(),
            start,
            features,
        })
    }
}

/// Pipeline selected by the chainmode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Block,
    Aead,
    /// Device-offloaded crypto (`disk`/`fmp`); the host pipeline is
    /// bypassed.
    Offload,
}

#[derive(Debug, Clone)]
pub(crate) struct CipherSpec {
    /// Crypto API name handed to the engine registry, e.g. `cbc(aes)`.
    pub api: String,
    pub ivmode: Option<String>,
    pub ivopts: Option<String>,
    pub tfms_count: usize,
    pub kind: CipherKind,
}

pub(crate) fn parse_cipher_spec(spec: &str, integrity_aead: bool) -> Result<CipherSpec, MapError> {
    if let Some(rest) = spec.strip_prefix("capi:") {
        return parse_cipher_capi(rest, integrity_aead);
    }
    parse_cipher_legacy(spec, integrity_aead)
}

fn parse_cipher_capi(rest: &str, integrity_aead: bool) -> Result<CipherSpec, MapError> {
    let (api, iv) = rest
        .split_once('-')
        .ok_or_else(|| MapError::CipherSpec(rest.to_string()))?;

    let (ivmode, ivopts) = match iv.split_once(':') {
        Some((mode, opts)) => (mode, Some(opts.to_string())),
        None => (iv, None),
    };

    let tfms_count = if ivmode == "lmk" { 64 } else { 1 };
    let kind = if integrity_aead { CipherKind::Aead } else { CipherKind::Block };

    Ok(CipherSpec {
        api: api.to_string(),
        ivmode: Some(ivmode.to_string()),
        ivopts,
        tfms_count,
        kind,
    })
}

fn parse_cipher_legacy(spec: &str, integrity_aead: bool) -> Result<CipherSpec, MapError> {
    // AEAD compositions need the pass-through grammar.
    if spec.contains('(') || integrity_aead {
        return Err(MapError::CipherSpec(spec.to_string()));
    }

    let mut parts = spec.splitn(3, '-');
    let cipher_count = parts.next().unwrap_or_default();
    let chainmode = parts.next();
    let iv = parts.next();

    let (cipher, tfms_count) = match cipher_count.split_once(':') {
        None => (cipher_count, 1),
        Some((cipher, count)) => {
            let count: usize = count.parse().map_err(|_| MapError::KeyCount)?;
            if !count.is_power_of_two() {
                return Err(MapError::KeyCount);
            }
            (cipher, count)
        }
    };
    if cipher.is_empty() {
        return Err(MapError::CipherSpec(spec.to_string()));
    }

    let (mut ivmode, ivopts) = match iv {
        None => (None, None),
        Some(iv) => match iv.split_once(':') {
            Some((mode, opts)) => (Some(mode.to_string()), Some(opts.to_string())),
            None => (Some(iv.to_string()), None),
        },
    };

    let kind = match ivmode.as_deref() {
        Some("disk") | Some("fmp") => CipherKind::Offload,
        _ => CipherKind::Block,
    };

    // Compatibility with the original mapping format: a bare cipher name
    // means cbc-plain.
    let chainmode = match chainmode {
        None => {
            ivmode = Some("plain".to_string());
            "cbc".to_string()
        }
        Some("plain") if ivmode.is_none() => {
            ivmode = Some("plain".to_string());
            "cbc".to_string()
        }
        Some(mode) => mode.to_string(),
    };

    if chainmode != "ecb" && ivmode.is_none() && kind != CipherKind::Offload {
        return Err(MapError::IvRequired);
    }

    Ok(CipherSpec {
        api: format!("{chainmode}({cipher})"),
        ivmode,
        ivopts,
        tfms_count,
        kind,
    })
}

/// Render the table line back out, feature count included, so a mapping
/// can be reconstructed from its own status.
pub(crate) fn status_table(core: &MappingCore) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    out.push_str(&core.cipher_string);
    out.push(' ');

    let key = core.key.lock().unwrap();
    if key.key_size > 0 {
        if let Some(reference) = &key.key_string {
            let _ = write!(out, ":{}:{}", key.key_size, reference);
        } else {
            for b in key.key.iter() {
                let _ = write!(out, "{b:02x}");
            }
        }
    } else {
        out.push('-');
    }
    drop(key);

    let _ = write!(out, " {} {} {}", core.iv_offset, core.dev.name(), core.start);

    let mut features: Vec<String> = Vec::new();
    if core.flags.allow_discards {
        features.push("allow_discards".to_string());
    }
    if core.flags.same_cpu {
        features.push("same_cpu_crypt".to_string());
    }
    if core.flags.no_offload {
        features.push("submit_from_crypt_cpus".to_string());
    }
    if core.integrity.on_disk_tag_size > 0 {
        features.push(format!(
            "integrity:{}:{}",
            core.integrity.on_disk_tag_size,
            core.cipher_auth.as_deref().unwrap_or("none")
        ));
    }
    if core.sector_size != (1 << SECTOR_SHIFT) {
        features.push(format!("sector_size:{}", core.sector_size));
    }
    if core.flags.iv_large_sectors {
        features.push("iv_large_sectors".to_string());
    }

    if !features.is_empty() {
        let _ = write!(out, " {}", features.len());
        for f in features {
            let _ = write!(out, " {f}");
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positional_arguments() {
        let args = TableArgs::parse(
            "aes-cbc-essiv:sha256 00112233445566778899aabbccddeeff 0 /dev/ram0 2048",
        )
        .unwrap();
        assert_eq!(args.cipher_spec, "aes-cbc-essiv:sha256");
        assert_eq!(args.iv_offset, 0);
        assert_eq!(args.device, "/dev/ram0");
        assert_eq!(args.start, 2048);
        assert_eq!(args.features, Features::default());
    }

    #[test]
    fn parses_feature_group() {
        let args = TableArgs::parse(
            "aes-xts-plain64 - 0 disk0 0 4 allow_discards sector_size:4096 iv_large_sectors integrity:28:aead",
        )
        .unwrap();
        assert!(args.features.allow_discards);
        assert!(args.features.iv_large_sectors);
        assert_eq!(args.features.sector_size, Some(4096));
        assert_eq!(args.features.integrity, Some((28, "aead".to_string())));
        assert!(args.features.integrity_aead());
    }

    #[test]
    fn feature_count_must_match() {
        assert!(matches!(
            TableArgs::parse("aes-cbc-plain - 0 d 0 2 allow_discards"),
            Err(MapError::FeatureCount)
        ));
        assert!(matches!(
            TableArgs::parse("aes-cbc-plain - 0 d 0 7 a b c d e f g"),
            Err(MapError::FeatureCount)
        ));
    }

    #[test]
    fn rejects_bad_sector_sizes() {
        for bad in ["sector_size:256", "sector_size:8192", "sector_size:1000"] {
            let line = format!("aes-cbc-plain - 0 d 0 1 {bad}");
            assert!(matches!(TableArgs::parse(&line), Err(MapError::SectorSize)));
        }
    }

    #[test]
    fn legacy_spec_full_form() {
        let spec = parse_cipher_spec("aes-cbc-essiv:sha256", false).unwrap();
        assert_eq!(spec.api, "cbc(aes)");
        assert_eq!(spec.ivmode.as_deref(), Some("essiv"));
        assert_eq!(spec.ivopts.as_deref(), Some("sha256"));
        assert_eq!(spec.tfms_count, 1);
        assert_eq!(spec.kind, CipherKind::Block);
    }

    #[test]
    fn legacy_spec_keycount() {
        let spec = parse_cipher_spec("aes:4-cbc-plain64", false).unwrap();
        assert_eq!(spec.api, "cbc(aes)");
        assert_eq!(spec.tfms_count, 4);

        assert!(matches!(
            parse_cipher_spec("aes:3-cbc-plain64", false),
            Err(MapError::KeyCount)
        ));
    }

    #[test]
    fn bare_cipher_expands_to_cbc_plain() {
        let spec = parse_cipher_spec("aes", false).unwrap();
        assert_eq!(spec.api, "cbc(aes)");
        assert_eq!(spec.ivmode.as_deref(), Some("plain"));
    }

    #[test]
    fn ecb_needs_no_iv_but_cbc_does() {
        let spec = parse_cipher_spec("aes-ecb", false).unwrap();
        assert_eq!(spec.api, "ecb(aes)");
        assert_eq!(spec.ivmode, None);

        assert!(matches!(
            parse_cipher_spec("aes-cbc", false),
            Err(MapError::IvRequired)
        ));
    }

    #[test]
    fn offload_chainmodes_select_the_offload_pipeline() {
        let spec = parse_cipher_spec("aes-xts-disk", false).unwrap();
        assert_eq!(spec.kind, CipherKind::Offload);
        let spec = parse_cipher_spec("aes-xts-fmp", false).unwrap();
        assert_eq!(spec.kind, CipherKind::Offload);
    }

    #[test]
    fn capi_spec_passes_through() {
        let spec =
            parse_cipher_spec("capi:authenc(hmac(sha256),cbc(aes))-random", true).unwrap();
        assert_eq!(spec.api, "authenc(hmac(sha256),cbc(aes))");
        assert_eq!(spec.ivmode.as_deref(), Some("random"));
        assert_eq!(spec.kind, CipherKind::Aead);
    }

    #[test]
    fn capi_lmk_defaults_to_64_engines() {
        let spec = parse_cipher_spec("capi:cbc(aes)-lmk", false).unwrap();
        assert_eq!(spec.tfms_count, 64);
    }

    #[test]
    fn legacy_rejects_parenthesised_and_aead_specs() {
        assert!(parse_cipher_spec("cbc(aes)-plain", false).is_err());
        assert!(parse_cipher_spec("aes-cbc-plain", true).is_err());
    }
}
