//! `Range` header parsing and validation.

use std::sync::LazyLock;

/// Matches one range spec: `a-b`, `a-`, or `-n`.
static RE_RANGE_SPEC: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^(\d*)-(\d*)$").unwrap());

/// One requested byte range, before resolution against a resource length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `a-b` (inclusive) or `a-` when `end` is None.
    FromStart { start: u64, end: Option<u64> },
    /// `-n`: the final n bytes.
    Suffix(u64),
}

/// A resolved inclusive byte range within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false // start <= end by construction
    }
}

/// Parse a `Range` header value (`bytes=...`) into its specs.
///
/// Returns None for anything malformed: wrong unit, non-numeric bounds,
/// descending bounds, or an empty spec list.
#[must_use]
pub fn parse(value: &str) -> Option<Vec<RangeSpec>> {
    let rest = value.trim().strip_prefix("bytes=")?;
    let mut specs = Vec::new();
    for part in rest.split(',') {
        let caps = RE_RANGE_SPEC.captures(part.trim())?;
        let start = &caps[1];
        let end = &caps[2];
        let spec = match (start.is_empty(), end.is_empty()) {
            (true, true) => return None, // bare "-"
            (true, false) => RangeSpec::Suffix(end.parse().ok()?),
            (false, true) => RangeSpec::FromStart {
                start: start.parse().ok()?,
                end: None,
            },
            (false, false) => {
                let (s, e): (u64, u64) = (start.parse().ok()?, end.parse().ok()?);
                if e < s {
                    return None; // descending
                }
                RangeSpec::FromStart {
                    start: s,
                    end: Some(e),
                }
            }
        };
        specs.push(spec);
    }
    if specs.is_empty() {
        return None;
    }
    Some(specs)
}

/// Resolve specs against a resource of `len` bytes.
///
/// Ranges must be in ascending order and non-overlapping, and every range
/// must intersect the resource; otherwise the whole set is rejected and the
/// response falls back to the full body.
#[must_use]
pub fn resolve(specs: &[RangeSpec], len: u64) -> Option<Vec<ByteRange>> {
    if len == 0 {
        return None;
    }
    let mut out: Vec<ByteRange> = Vec::with_capacity(specs.len());
    for spec in specs {
        let r = match *spec {
            RangeSpec::FromStart { start, end } => {
                if start >= len {
                    return None;
                }
                ByteRange {
                    start,
                    end: end.map_or(len - 1, |e| e.min(len - 1)),
                }
            }
            RangeSpec::Suffix(n) => {
                if n == 0 {
                    return None;
                }
                ByteRange {
                    start: len.saturating_sub(n),
                    end: len - 1,
                }
            }
        };
        if let Some(prev) = out.last() {
            if r.start <= prev.end {
                return None; // overlapping or descending set
            }
        }
        out.push(r);
    }
    Some(out)
}
