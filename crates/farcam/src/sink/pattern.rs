//! Destination name expansion for segmented output
//!
//! A destination containing a printf-style integer conversion (`%d`, `%u`,
//! optionally with flags and width such as `%04d`) is numbered by segment.
//! Any other destination is treated as a strftime pattern and expanded
//! against local time.

use anyhow::{bail, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};
use std::fmt::Display;

/// How a segmented destination name is generated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentNaming {
    /// `%d`/`%u` placeholder replaced with the segment number
    Number,
    /// strftime pattern expanded against the current local time
    Timestamp,
}

const FLAGS: &[char] = &['-', '+', ' ', '0', '#'];

/// Parsed integer conversion: byte range in the template plus its format
#[derive(Debug, PartialEq, Eq)]
struct Conversion {
    start: usize,
    end: usize,
    left_align: bool,
    zero_pad: bool,
    plus_sign: bool,
    space_sign: bool,
    width: usize,
}

/// Locate the first `%[flags][width](d|u)` conversion, skipping `%%`
fn find_conversion(template: &str) -> Option<Conversion> {
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            i += 1;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'%') {
            i += 2;
            continue;
        }

        let start = i;
        let mut j = i + 1;
        let mut conv = Conversion {
            start,
            end: 0,
            left_align: false,
            zero_pad: false,
            plus_sign: false,
            space_sign: false,
            width: 0,
        };
        while j < bytes.len() && FLAGS.contains(&(bytes[j] as char)) {
            match bytes[j] {
                b'-' => conv.left_align = true,
                b'0' => conv.zero_pad = true,
                b'+' => conv.plus_sign = true,
                b' ' => conv.space_sign = true,
                _ => {}
            }
            j += 1;
        }
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            conv.width = conv.width * 10 + (bytes[j] - b'0') as usize;
            j += 1;
        }
        if matches!(bytes.get(j), Some(b'd') | Some(b'u')) {
            conv.end = j + 1;
            return Some(conv);
        }
        // The first conversion decides the naming mode
        return None;
    }
    None
}

/// Naming mode implied by a destination template
pub fn naming_for(template: &str) -> SegmentNaming {
    if find_conversion(template).is_some() {
        SegmentNaming::Number
    } else {
        SegmentNaming::Timestamp
    }
}

/// Replace the integer placeholder with `number`, honouring flags and width.
///
/// Returns `None` when the template has no such placeholder.
pub fn expand_segment_number(template: &str, number: u32) -> Option<String> {
    let conv = find_conversion(template)?;

    let sign = if conv.plus_sign {
        "+"
    } else if conv.space_sign {
        " "
    } else {
        ""
    };
    let digits = number.to_string();
    let body_len = sign.len() + digits.len();
    let pad = conv.width.saturating_sub(body_len);

    let formatted = if conv.left_align {
        format!("{sign}{digits}{}", " ".repeat(pad))
    } else if conv.zero_pad {
        format!("{sign}{}{digits}", "0".repeat(pad))
    } else {
        format!("{}{sign}{digits}", " ".repeat(pad))
    };

    let before = template[..conv.start].replace("%%", "%");
    let after = template[conv.end..].replace("%%", "%");
    Some(format!("{before}{formatted}{after}"))
}

/// Expand a strftime pattern against `now`
pub fn expand_time_pattern<Tz>(template: &str, now: &DateTime<Tz>) -> Result<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let items: Vec<Item<'_>> = StrftimeItems::new(template).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        bail!("invalid time pattern in destination {:?}", template);
    }
    Ok(now.format_with_items(items.into_iter()).to_string())
}

/// Produce the concrete destination for the current segment
pub fn expand_destination<Tz>(
    template: &str,
    segment_number: u32,
    now: &DateTime<Tz>,
) -> Result<String>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    match expand_segment_number(template, segment_number) {
        Some(name) => Ok(name),
        None => expand_time_pattern(template, now),
    }
}
