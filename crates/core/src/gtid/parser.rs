/// Winnow-based parser for the textual GTID set format.
///
/// Grammar:
/// ```text
/// gtid_set  = ws? (uuid_set (ws? "," ws? uuid_set)*)? ws?
/// uuid_set  = UUID (":" interval)+
/// interval  = INTEGER ("-" INTEGER)?
/// UUID      = [0-9a-fA-F-]+
/// ws        = (" " | "\t" | "\n" | "\r")+
/// ```
///
/// Servers print sets with `",\n"` between source UUIDs; both forms parse.
use std::fmt;

use winnow::ascii::dec_uint;
use winnow::combinator::{opt, preceded, repeat, separated};
use winnow::prelude::*;
use winnow::token::{literal, take_while};
use winnow::ModalResult;

use super::Interval;

// ---------------------------------------------------------------------------
// Public error type
// ---------------------------------------------------------------------------

/// A GTID set that does not follow the textual format.
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid GTID set at offset {}: {}",
            self.offset, self.message
        )
    }
}

impl std::error::Error for ParseError {}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Parse a GTID set into its `(uuid, intervals)` groups, in textual order.
///
/// Nothing is merged or sorted here.
///
/// # Errors
///
/// Returns a [`ParseError`] when the text does not conform to the grammar or
/// an interval ends before it starts.
pub fn parse_gtid_set(input: &str) -> Result<Vec<(String, Vec<Interval>)>, ParseError> {
    let original = input;
    let mut stream: &str = input;
    let groups = match gtid_set.parse_next(&mut stream) {
        Ok(groups) => groups,
        Err(e) => {
            return Err(ParseError {
                message: e.to_string(),
                offset: original.len().saturating_sub(stream.len()),
            })
        }
    };
    if !stream.is_empty() {
        return Err(ParseError {
            message: "unexpected trailing input".to_string(),
            offset: original.len() - stream.len(),
        });
    }
    for (uuid, intervals) in &groups {
        if let Some(bad) = intervals.iter().find(|i| i.start > i.end || i.start == 0) {
            return Err(ParseError {
                message: format!("bad interval {}-{} for {uuid}", bad.start, bad.end),
                offset: 0,
            });
        }
    }
    Ok(groups)
}

// ---------------------------------------------------------------------------
// Leaf parsers
// ---------------------------------------------------------------------------

fn ws(input: &mut &str) -> ModalResult<()> {
    take_while(0.., |c: char| c.is_ascii_whitespace())
        .void()
        .parse_next(input)
}

fn uuid(input: &mut &str) -> ModalResult<String> {
    take_while(1.., |c: char| c.is_ascii_hexdigit() || c == '-')
        .map(str::to_ascii_lowercase)
        .parse_next(input)
}

fn number(input: &mut &str) -> ModalResult<u64> {
    dec_uint.parse_next(input)
}

/// `INTEGER ("-" INTEGER)?`
fn interval(input: &mut &str) -> ModalResult<Interval> {
    let start = number.parse_next(input)?;
    let end = opt(preceded(literal("-"), number)).parse_next(input)?;
    Ok(Interval {
        start,
        end: end.unwrap_or(start),
    })
}

/// `UUID (":" interval)+`
fn uuid_set(input: &mut &str) -> ModalResult<(String, Vec<Interval>)> {
    let source = uuid.parse_next(input)?;
    let intervals: Vec<Interval> = repeat(1.., preceded(literal(":"), interval)).parse_next(input)?;
    Ok((source, intervals))
}

fn separator(input: &mut &str) -> ModalResult<()> {
    (ws, literal(","), ws).void().parse_next(input)
}

fn gtid_set(input: &mut &str) -> ModalResult<Vec<(String, Vec<Interval>)>> {
    ws.parse_next(input)?;
    let groups: Option<Vec<(String, Vec<Interval>)>> =
        opt(separated(1.., uuid_set, separator)).parse_next(input)?;
    ws.parse_next(input)?;
    Ok(groups.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const B: &str = "8a94f357-aab4-11df-86ab-c80aa9429562";

    #[test]
    fn parses_empty_set() {
        assert!(parse_gtid_set("").unwrap().is_empty());
        assert!(parse_gtid_set("  \n").unwrap().is_empty());
    }

    #[test]
    fn parses_server_output() {
        let text = format!("{A}:1-5:7,\n{B}:3");
        let groups = parse_gtid_set(&text).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, A);
        assert_eq!(
            groups[0].1,
            vec![Interval { start: 1, end: 5 }, Interval { start: 7, end: 7 }]
        );
        assert_eq!(groups[1].1, vec![Interval { start: 3, end: 3 }]);
    }

    #[test]
    fn uppercase_uuids_are_lowered() {
        let text = format!("{}:1", A.to_ascii_uppercase());
        assert_eq!(parse_gtid_set(&text).unwrap()[0].0, A);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_gtid_set(A).is_err());
        assert!(parse_gtid_set(&format!("{A}:5-2")).is_err());
        assert!(parse_gtid_set(&format!("{A}:0")).is_err());
        assert!(parse_gtid_set(&format!("{A}:1 garbage")).is_err());
    }
}
