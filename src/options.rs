// Option negotiation (RFC 2347, 2348, 2349).
//
// A request may carry option/value pairs after its mode. The server answers with an OACK that
// echoes back only the options it honors; anything it does not recognize is quietly left out.
// When nothing is honored no OACK may be sent at all and the transfer proceeds exactly as in
// RFC 1350.

use crate::tftp::{OptionList, RequestKind};
use std::error;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_BLOCK_SIZE: u16 = 512; // RFC 1350
pub const MIN_BLOCK_SIZE: u16 = 8; // RFC 2348
pub const MAX_BLOCK_SIZE: u16 = 65464; // RFC 2348

pub const MIN_TIMEOUT_SECS: u64 = 1; // RFC 2349
pub const MAX_TIMEOUT_SECS: u64 = 255; // RFC 2349

/// Server-side bounds applied while negotiating.
#[derive(Debug, Clone)]
pub struct Limits {
    /// The largest blksize the server agrees to. Requests above it are refused.
    pub max_block_size: u16,

    /// The retransmission timeout used when the client does not negotiate one.
    pub default_timeout: Duration,
}

/// The parameters a session runs with once negotiation is over.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedOptions {
    pub block_size: u16,
    pub timeout: Duration,
    pub transfer_size: Option<u64>,
}

/// The result of negotiating a request's options.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiation {
    pub options: NegotiatedOptions,

    /// The pairs to echo in an OACK, in request order. Empty when no option was honored.
    pub acknowledged: OptionList,
}

impl Negotiation {
    /// Whether an OACK has to be sent before the transfer starts.
    pub fn needs_oack(&self) -> bool {
        !self.acknowledged.is_empty()
    }
}

/// A requested option the server refuses, failing the whole request.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionRejected {
    pub name: String,
    pub value: String,
    pub reason: String,
}

impl error::Error for OptionRejected {}

impl fmt::Display for OptionRejected {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Option {}={} rejected: {}", self.name, self.value, self.reason)
    }
}

/// Negotiates the options of a request.
///
/// `source_size` is the size of the file being read, if known. It is only consulted for read
/// requests; on writes the client's declared tsize is echoed back without being checked.
pub fn negotiate(
    kind: RequestKind,
    requested: &[(String, String)],
    limits: &Limits,
    source_size: Option<u64>,
) -> Result<Negotiation, OptionRejected> {
    let mut options = NegotiatedOptions {
        block_size: DEFAULT_BLOCK_SIZE,
        timeout: limits.default_timeout,
        transfer_size: None,
    };
    let mut acknowledged: OptionList = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    for (raw_name, value) in requested {
        let name = raw_name.to_lowercase();
        if seen.contains(&name) {
            log::debug!("Ignoring repeated option {name}");
            continue;
        }
        seen.push(name.clone());

        match name.as_str() {
            "blksize" => {
                let block_size = negotiate_block_size(value, limits)?;
                options.block_size = block_size;
                acknowledged.push((name, block_size.to_string()));
            }
            "timeout" => match value.parse::<u64>() {
                Ok(secs) if (MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&secs) => {
                    options.timeout = Duration::from_secs(secs);
                    acknowledged.push((name, secs.to_string()));
                }
                _ => log::debug!("Dropping out-of-range timeout option '{value}'"),
            },
            "tsize" => {
                let size = match kind {
                    RequestKind::Read => source_size,
                    RequestKind::Write => value.parse::<u64>().ok(),
                };
                match size {
                    Some(size) => {
                        options.transfer_size = Some(size);
                        acknowledged.push((name, size.to_string()));
                    }
                    None => log::debug!("Dropping tsize option '{value}', size is unknown"),
                }
            }
            _ => log::debug!("Dropping unsupported option {raw_name}={value}"),
        }
    }

    Ok(Negotiation { options, acknowledged })
}

fn negotiate_block_size(value: &str, limits: &Limits) -> Result<u16, OptionRejected> {
    let reject = |reason: String| OptionRejected {
        name: "blksize".to_string(),
        value: value.to_string(),
        reason,
    };

    let requested: u64 = value
        .parse()
        .map_err(|_| reject("not a number".to_string()))?;
    if requested < u64::from(MIN_BLOCK_SIZE) || requested > u64::from(MAX_BLOCK_SIZE) {
        return Err(reject(format!("must be between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}")));
    }
    // Refused rather than clamped down; RFC 2348 allows either.
    if requested > u64::from(limits.max_block_size) {
        return Err(reject(format!("server allows at most {}", limits.max_block_size)));
    }
    Ok(requested as u16)
}
