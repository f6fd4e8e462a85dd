//! FIX tag/value parsing and per-connection message framing.
//!
//! The gateway understands a deliberately small slice of FIX: SOH-delimited
//! `tag=value` fields, of which five tags are decoded (35 MsgType, 55 Symbol,
//! 54 Side, 44 Price, 38 OrderQty). Checksums, body length and session
//! sequence numbers are not modeled.
//!
//! Prices are parsed as decimal text straight into fixed-point ticks
//! (price x 10000); no floating point touches the order path, and a price
//! the tick grid cannot represent is rejected rather than rounded.
//!
//! # Framing
//!
//! A TCP read may carry a partial message, one message, or several.
//! [`FrameBuffer`] accumulates bytes per connection: everything after the
//! last SOH is retained until its terminating SOH arrives (mid-field splits
//! reassemble), and the SOH-complete region is cut into messages wherever a
//! `8=` (BeginString) field starts at a field boundary.

use thiserror::Error;

/// Start-of-Heading byte, the FIX field delimiter.
pub const SOH: u8 = 0x01;

/// Fixed-point price scale: ticks per unit.
pub const PRICE_SCALE: i64 = 10_000;

/// Order side, tag 54.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Value carried in the IPC SIDE field: 0 = buy, 1 = sell.
    pub fn wire_value(self) -> u64 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }
}

/// Parse failures. Each one drops the offending message; the session
/// continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixError {
    /// Tag 35 absent or empty: the frame cannot be classified.
    #[error("missing or empty MsgType (tag 35)")]
    MissingMsgType,

    /// Tag 54 is neither "1" (buy) nor "2" (sell).
    #[error("unknown side `{0}` (tag 54)")]
    BadSide(String),

    /// Tag 44 is not a decimal price representable in x10000 ticks.
    #[error("unparseable price `{0}` (tag 44)")]
    BadPrice(String),

    /// Tag 38 is not a base-10 quantity.
    #[error("unparseable quantity `{0}` (tag 38)")]
    BadQty(String),
}

/// One parsed FIX message. Only `msg_type` is mandatory; the dispatcher
/// checks per-message-type which of the rest it needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FixFrame {
    pub msg_type: String,
    pub symbol: Option<String>,
    pub side: Option<Side>,
    /// Fixed-point ticks (price x 10000).
    pub price: Option<i64>,
    pub qty: Option<u64>,
}

/// Parses one SOH-delimited FIX message.
///
/// Segments without `=` (or with non-UTF-8 bytes) are skipped; unknown tags
/// are ignored; a repeated tag keeps its last value.
///
/// # Errors
///
/// [`FixError::MissingMsgType`] when tag 35 is absent or empty, and the
/// `Bad*` variants when a decoded tag's value does not parse.
pub fn parse(raw: &[u8]) -> Result<FixFrame, FixError> {
    let mut frame = FixFrame::default();

    for segment in raw.split(|&b| b == SOH) {
        if segment.is_empty() {
            continue;
        }
        let Ok(segment) = std::str::from_utf8(segment) else {
            continue;
        };
        let Some((tag, value)) = segment.split_once('=') else {
            continue;
        };

        match tag {
            "35" => frame.msg_type = value.to_string(),
            "55" => frame.symbol = Some(value.to_string()),
            "54" => frame.side = Some(parse_side(value)?),
            "44" => frame.price = Some(parse_price(value)?),
            "38" => {
                frame.qty =
                    Some(value.parse::<u64>().map_err(|_| FixError::BadQty(value.to_string()))?);
            }
            _ => {}
        }
    }

    if frame.msg_type.is_empty() {
        return Err(FixError::MissingMsgType);
    }
    Ok(frame)
}

/// Tag 54: "1" is buy, "2" is sell, everything else is rejected (not
/// defaulted to sell; a silently mis-classified side is worse than a
/// dropped order).
fn parse_side(value: &str) -> Result<Side, FixError> {
    match value {
        "1" => Ok(Side::Buy),
        "2" => Ok(Side::Sell),
        other => Err(FixError::BadSide(other.to_string())),
    }
}

/// Parses decimal text into x10000 ticks with checked arithmetic.
///
/// Accepts an optional sign, an integer part, and up to four fraction
/// digits. More than four fraction digits means the price is off the tick
/// grid and is rejected.
fn parse_price(value: &str) -> Result<i64, FixError> {
    let bad = || FixError::BadPrice(value.to_string());

    let (negative, digits) = match value.as_bytes() {
        [b'-', rest @ ..] => (true, rest),
        [b'+', rest @ ..] => (false, rest),
        rest => (false, rest),
    };

    let mut parts = digits.splitn(2, |&b| b == b'.');
    let int_part = parts.next().unwrap_or(&[]);
    let frac_part = parts.next();

    if int_part.is_empty() && frac_part.map_or(true, <[u8]>::is_empty) {
        return Err(bad());
    }
    if let Some(frac) = frac_part {
        if frac.len() > 4 {
            return Err(bad());
        }
    }

    let mut ticks: i64 = 0;
    for &b in int_part {
        if !b.is_ascii_digit() {
            return Err(bad());
        }
        ticks = ticks
            .checked_mul(10)
            .and_then(|t| t.checked_add(i64::from(b - b'0')))
            .ok_or_else(bad)?;
    }
    ticks = ticks.checked_mul(PRICE_SCALE).ok_or_else(bad)?;

    if let Some(frac) = frac_part {
        let mut frac_ticks: i64 = 0;
        for &b in frac {
            if !b.is_ascii_digit() {
                return Err(bad());
            }
            frac_ticks = frac_ticks * 10 + i64::from(b - b'0');
        }
        // Scale e.g. "5" (one digit) to 5000 ticks.
        for _ in frac.len()..4 {
            frac_ticks *= 10;
        }
        ticks = ticks.checked_add(frac_ticks).ok_or_else(bad)?;
    }

    Ok(if negative { -ticks } else { ticks })
}

/// Per-connection reassembly buffer.
///
/// Feed raw socket bytes in; complete messages come out. Bytes after the
/// last SOH stay buffered until the field they belong to is terminated, so
/// a message split mid-field by TCP segmentation survives intact. Bytes
/// with no SOH at all (stray garbage) sit in the buffer and are absorbed
/// into an unknown tag by whatever complete message follows.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and splits off every complete message.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(bytes);

        // Only fully SOH-terminated fields are eligible for parsing.
        let Some(last_soh) = self.pending.iter().rposition(|&b| b == SOH) else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.pending.drain(..=last_soh).collect();

        // Cut at every BeginString field that starts at a field boundary;
        // the leading chunk (fields before any "8=") is a message of its own.
        let mut boundaries = vec![0];
        for idx in 1..complete.len().saturating_sub(1) {
            if complete[idx - 1] == SOH && complete[idx] == b'8' && complete[idx + 1] == b'=' {
                boundaries.push(idx);
            }
        }
        boundaries.push(complete.len());

        boundaries
            .windows(2)
            .filter(|w| w[1] > w[0])
            .map(|w| complete[w[0]..w[1]].to_vec())
            .collect()
    }

    /// Bytes currently awaiting their field terminator.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soh_join(fields: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for field in fields {
            out.extend_from_slice(field.as_bytes());
            out.push(SOH);
        }
        out
    }

    #[test]
    fn parses_new_order_single() {
        let raw = soh_join(&["8=FIX.4.2", "35=D", "55=AAPL", "54=1", "38=100", "44=150.50"]);
        let frame = parse(&raw).unwrap();
        assert_eq!(frame.msg_type, "D");
        assert_eq!(frame.symbol.as_deref(), Some("AAPL"));
        assert_eq!(frame.side, Some(Side::Buy));
        assert_eq!(frame.qty, Some(100));
        assert_eq!(frame.price, Some(1_505_000));
    }

    #[test]
    fn missing_msg_type_is_invalid() {
        let raw = soh_join(&["8=FIX.4.2", "55=AAPL"]);
        assert_eq!(parse(&raw), Err(FixError::MissingMsgType));
        let raw = soh_join(&["35=", "55=AAPL"]);
        assert_eq!(parse(&raw), Err(FixError::MissingMsgType));
    }

    #[test]
    fn segments_without_equals_are_skipped() {
        let raw = soh_join(&["garbage", "35=A", "alsogarbage"]);
        let frame = parse(&raw).unwrap();
        assert_eq!(frame.msg_type, "A");
    }

    #[test]
    fn unknown_side_is_rejected() {
        let raw = soh_join(&["35=D", "54=3"]);
        assert_eq!(parse(&raw), Err(FixError::BadSide("3".to_string())));
        let raw = soh_join(&["35=D", "54=buy"]);
        assert!(matches!(parse(&raw), Err(FixError::BadSide(_))));
    }

    #[test]
    fn sell_side_parses() {
        let raw = soh_join(&["35=D", "54=2"]);
        assert_eq!(parse(&raw).unwrap().side, Some(Side::Sell));
        assert_eq!(Side::Sell.wire_value(), 1);
        assert_eq!(Side::Buy.wire_value(), 0);
    }

    #[test]
    fn price_parses_without_floating_point_loss() {
        for (text, ticks) in [
            ("150.50", 1_505_000),
            ("100", 1_000_000),
            ("0.0001", 1),
            ("0.1", 1_000),
            (".5", 5_000),
            ("-2.25", -22_500),
            ("+3", 30_000),
            ("123.4567", 1_234_567),
        ] {
            let raw = soh_join(&["35=D", &format!("44={text}")]);
            assert_eq!(parse(&raw).unwrap().price, Some(ticks), "price {text}");
        }
    }

    #[test]
    fn off_grid_or_malformed_prices_are_rejected() {
        for text in ["150.50001", "1.23456", "", ".", "12a", "--5", "1e3"] {
            let raw = soh_join(&["35=D", &format!("44={text}")]);
            assert!(
                matches!(parse(&raw), Err(FixError::BadPrice(_))),
                "price `{text}` must be rejected"
            );
        }
    }

    #[test]
    fn bad_quantity_is_rejected() {
        let raw = soh_join(&["35=D", "38=ten"]);
        assert!(matches!(parse(&raw), Err(FixError::BadQty(_))));
        let raw = soh_join(&["35=D", "38=-5"]);
        assert!(matches!(parse(&raw), Err(FixError::BadQty(_))));
    }

    #[test]
    fn frame_buffer_passes_single_message_through() {
        let mut fb = FrameBuffer::new();
        let msg = soh_join(&["8=FIX.4.2", "35=D", "55=AAPL"]);
        let out = fb.push_bytes(&msg);
        assert_eq!(out, vec![msg]);
        assert_eq!(fb.pending_len(), 0);
    }

    #[test]
    fn frame_buffer_reassembles_split_before_first_soh() {
        let mut fb = FrameBuffer::new();
        let msg = soh_join(&["8=FIX.4.2", "35=D", "55=AAPL", "54=1", "38=100", "44=150.50"]);
        let (a, b) = msg.split_at(4); // cut inside "8=FIX.4.2"

        assert!(fb.push_bytes(a).is_empty());
        assert_eq!(fb.pending_len(), 4, "partial field must be retained");

        let out = fb.push_bytes(b);
        assert_eq!(out, vec![msg], "message must arrive intact");
        assert_eq!(fb.pending_len(), 0);
    }

    #[test]
    fn frame_buffer_flushes_complete_fields_eagerly() {
        // Without body-length framing, a sender that pauses after a complete
        // field gets its message cut there: the head is handed on at once
        // (and rejected downstream if fields are missing), the tail parses
        // on its own. Nothing is silently merged into a later message.
        let mut fb = FrameBuffer::new();
        let msg = soh_join(&["8=FIX.4.2", "35=D", "55=AAPL", "54=1", "38=100", "44=150.50"]);
        let (a, b) = msg.split_at(msg.len() - 10); // cut right before "44=150.50"

        let head = fb.push_bytes(a);
        assert_eq!(head.len(), 1);
        let head_frame = parse(&head[0]).unwrap();
        assert_eq!(head_frame.msg_type, "D");
        assert_eq!(head_frame.price, None);

        let tail = fb.push_bytes(b);
        assert_eq!(tail.len(), 1);
        assert_eq!(parse(&tail[0]), Err(FixError::MissingMsgType));
    }

    #[test]
    fn frame_buffer_splits_pipelined_messages() {
        let mut fb = FrameBuffer::new();
        let first = soh_join(&["8=FIX.4.2", "35=D", "55=AAPL", "54=1", "38=1", "44=1"]);
        let second = soh_join(&["8=FIX.4.2", "35=D", "55=MSFT", "54=2", "38=2", "44=2"]);
        let mut wire = first.clone();
        wire.extend_from_slice(&second);

        let out = fb.push_bytes(&wire);
        assert_eq!(out, vec![first, second]);
    }

    #[test]
    fn frame_buffer_holds_garbage_without_soh() {
        let mut fb = FrameBuffer::new();
        assert!(fb.push_bytes(b"THIS_IS_NOT_FIX").is_empty());
        assert_eq!(fb.pending_len(), 15);

        // Real traffic absorbs the garbage into an unknown leading tag.
        let order = soh_join(&["8=FIX.4.2", "35=D", "55=GOOG", "54=1", "38=10", "44=99"]);
        let out = fb.push_bytes(&order);
        assert_eq!(out.len(), 1);
        let frame = parse(&out[0]).unwrap();
        assert_eq!(frame.msg_type, "D");
        assert_eq!(frame.symbol.as_deref(), Some("GOOG"));
    }

    #[test]
    fn frame_buffer_message_split_at_begin_string() {
        // "8=" inside a value must not split a message.
        let mut fb = FrameBuffer::new();
        let msg = soh_join(&["35=D", "55=WEIRD8=X"]);
        let out = fb.push_bytes(&msg);
        assert_eq!(out, vec![msg]);
    }
}
