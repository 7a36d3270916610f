//! # fleetq-hostlist
//!
//! Parsing and expansion of the compact host-range notation emitted by batch
//! schedulers, e.g. `node[01-03,07]` for `node01 node02 node03 node07`.
//!
//! ## Rules
//!
//! - The bracketed expression is a comma-separated list of elements.
//! - An element containing `-` is an inclusive numeric range; every integer
//!   in `[start, end]` is emitted, left-zero-padded to the width of `start`
//!   as it was written (`007-9` keeps three digits).
//! - Any other element is appended to the prefix literally.
//! - A string without brackets is a single hostname and passes through
//!   unchanged.
//!
//! Expansion is pure and allocation-only; it performs no I/O.

use thiserror::Error;

/// Errors from host-range parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostlistError {
    /// An opening bracket without a matching closing bracket.
    #[error("unterminated bracket expression in {0:?}")]
    UnterminatedBracket(String),

    /// A range bound that is not a decimal integer.
    #[error("invalid range bound {bound:?} in {element:?}")]
    InvalidBound { element: String, bound: String },
}

/// Expand a compact host-range string into explicit hostnames.
///
/// ```
/// use fleetq_hostlist::expand;
///
/// let nodes = expand("node[01-03]").unwrap();
/// assert_eq!(nodes, vec!["node01", "node02", "node03"]);
/// ```
pub fn expand(nodelist: &str) -> Result<Vec<String>, HostlistError> {
    let Some(open) = nodelist.find('[') else {
        return Ok(vec![nodelist.to_string()]);
    };
    let Some(close) = nodelist.rfind(']').filter(|&c| c > open) else {
        return Err(HostlistError::UnterminatedBracket(nodelist.to_string()));
    };

    let prefix = &nodelist[..open];
    let mut nodes = Vec::new();

    for element in nodelist[open + 1..close].split(',') {
        let element = element.trim();
        match element.split_once('-') {
            Some((start, end)) => {
                let start = start.trim();
                let end = end.trim();
                let width = start.len();
                let start_n = parse_bound(element, start)?;
                let end_n = parse_bound(element, end)?;
                for n in start_n..=end_n {
                    nodes.push(format!("{prefix}{n:0width$}"));
                }
            }
            None => nodes.push(format!("{prefix}{element}")),
        }
    }

    Ok(nodes)
}

fn parse_bound(element: &str, bound: &str) -> Result<u64, HostlistError> {
    bound.parse().map_err(|_| HostlistError::InvalidBound {
        element: element.to_string(),
        bound: bound.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_padded_range() {
        let nodes = expand("node[01-03]").unwrap();
        assert_eq!(nodes, vec!["node01", "node02", "node03"]);
    }

    #[test]
    fn expands_literal_elements() {
        let nodes = expand("node[5,7]").unwrap();
        assert_eq!(nodes, vec!["node5", "node7"]);
    }

    #[test]
    fn passes_through_bare_hostname() {
        let nodes = expand("nodeA").unwrap();
        assert_eq!(nodes, vec!["nodeA"]);
    }

    #[test]
    fn mixes_ranges_and_literals() {
        let nodes = expand("c[1-2,10,20-21]").unwrap();
        assert_eq!(nodes, vec!["c1", "c2", "c10", "c20", "c21"]);
    }

    #[test]
    fn keeps_width_of_start_bound() {
        let nodes = expand("gpu[007-009]").unwrap();
        assert_eq!(nodes, vec!["gpu007", "gpu008", "gpu009"]);
    }

    #[test]
    fn width_can_grow_past_padding() {
        let nodes = expand("n[09-11]").unwrap();
        assert_eq!(nodes, vec!["n09", "n10", "n11"]);
    }

    #[test]
    fn reversed_range_is_empty() {
        let nodes = expand("n[5-3]").unwrap();
        assert!(nodes.is_empty());
    }

    #[test]
    fn trims_whitespace_in_elements() {
        let nodes = expand("n[ 1 , 3 - 4 ]").unwrap();
        assert_eq!(nodes, vec!["n1", "n3", "n4"]);
    }

    #[test]
    fn rejects_unterminated_bracket() {
        assert_eq!(
            expand("node[01-03"),
            Err(HostlistError::UnterminatedBracket("node[01-03".to_string()))
        );
    }

    #[test]
    fn rejects_non_numeric_bound() {
        assert!(matches!(
            expand("node[a-3]"),
            Err(HostlistError::InvalidBound { .. })
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn range_count_matches(prefix in "[a-z]{1,8}", start in 0u64..500, len in 0u64..40) {
                let end = start + len;
                let nodes = expand(&format!("{prefix}[{start}-{end}]")).unwrap();
                prop_assert_eq!(nodes.len() as u64, len + 1);
                for node in &nodes {
                    prop_assert!(node.starts_with(prefix.as_str()));
                }
            }

            #[test]
            fn padding_is_preserved(start in 0u64..99, len in 0u64..20) {
                let end = start + len;
                let nodes = expand(&format!("n[{start:04}-{end}]")).unwrap();
                for node in &nodes {
                    // every expanded suffix keeps the four-digit width
                    prop_assert_eq!(node.len(), "n".len() + 4);
                }
            }
        }
    }
}
