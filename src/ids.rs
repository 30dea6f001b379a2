// Parsing for the id selection syntax used by every subcommand that accepts `--job-ids`.
//
// Individual numbers, inclusive ranges `a-b`, and unions separated by `+`: `1-3+7`.

use std::collections::BTreeSet;

use crate::Error;

/// Parse an id selection string into a sorted, de-duplicated set of ids.
///
/// # Errors
/// Returns `Err(Error::InvalidIdSelection)` when a term is not a number or a range, or when
/// a range's start is greater than its end.
pub fn parse_ids(selection: &str) -> Result<Vec<i64>, Error> {
    let mut result = BTreeSet::new();

    for term in selection.split('+') {
        let term = term.trim();
        if term.is_empty() {
            return Err(Error::InvalidIdSelection(
                selection.to_string(),
                "empty term".to_string(),
            ));
        }

        if let Some((first, last)) = term.split_once('-') {
            let first: i64 = first.trim().parse().map_err(|_| {
                Error::InvalidIdSelection(selection.to_string(), format!("'{first}' is not an id"))
            })?;
            let last: i64 = last.trim().parse().map_err(|_| {
                Error::InvalidIdSelection(selection.to_string(), format!("'{last}' is not an id"))
            })?;

            if first > last {
                return Err(Error::InvalidIdSelection(
                    selection.to_string(),
                    format!("range start {first} is greater than end {last}"),
                ));
            }

            result.extend(first..=last);
        } else {
            let id: i64 = term.parse().map_err(|_| {
                Error::InvalidIdSelection(selection.to_string(), format!("'{term}' is not an id"))
            })?;
            result.insert(id);
        }
    }

    Ok(result.into_iter().collect())
}

/// Parse a list of id selection strings, merging them all together.
pub fn parse_ids_many(selections: &[String]) -> Result<Option<Vec<i64>>, Error> {
    if selections.is_empty() {
        return Ok(None);
    }

    let mut result = BTreeSet::new();
    for selection in selections {
        result.extend(parse_ids(selection)?);
    }

    Ok(Some(result.into_iter().collect()))
}

/// Parametric array range `first-last:step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArraySpec {
    pub first: i64,
    pub last: i64,
    pub step: i64,
}

impl ArraySpec {
    /// Parse a parametric range `first-last:step` (`:step` defaults to 1).
    ///
    /// # Errors
    /// Returns `Err(Error::InvalidArraySpec)` when the syntax is wrong, `first < 1`,
    /// `last < first`, or `step < 1`.
    pub fn parse(spec: &str) -> Result<ArraySpec, Error> {
        let invalid = |reason: &str| Error::InvalidArraySpec(spec.to_string(), reason.to_string());

        let (range, step) = match spec.split_once(':') {
            Some((range, step)) => (
                range,
                step.parse::<i64>()
                    .map_err(|_| invalid("step is not an integer"))?,
            ),
            None => (spec, 1),
        };

        let (first, last) = range
            .split_once('-')
            .ok_or_else(|| invalid("expected 'first-last[:step]'"))?;
        let first: i64 = first.parse().map_err(|_| invalid("first is not an integer"))?;
        let last: i64 = last.parse().map_err(|_| invalid("last is not an integer"))?;

        if first < 1 {
            return Err(invalid("first must be >= 1"));
        }
        if last < first {
            return Err(invalid("last must be >= first"));
        }
        if step < 1 {
            return Err(invalid("step must be >= 1"));
        }

        Ok(ArraySpec { first, last, step })
    }

    /// Enumerate the indices in this range.
    pub fn indices(&self) -> impl Iterator<Item = i64> + '_ {
        (self.first..=self.last).step_by(self.step as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_id() {
        assert_eq!(parse_ids("5").unwrap(), vec![5]);
    }

    #[test]
    fn range() {
        assert_eq!(parse_ids("1-3").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn union() {
        assert_eq!(parse_ids("1-3+7").unwrap(), vec![1, 2, 3, 7]);
    }

    #[test]
    fn union_deduplicates_and_sorts() {
        assert_eq!(parse_ids("7+1-3+2").unwrap(), vec![1, 2, 3, 7]);
    }

    #[test]
    fn invalid_reversed_range() {
        assert!(parse_ids("3-1").is_err());
    }

    #[test]
    fn invalid_not_a_number() {
        assert!(parse_ids("abc").is_err());
    }

    #[test]
    fn many_merges_across_args() {
        let selections = vec!["1-2".to_string(), "5".to_string()];
        assert_eq!(parse_ids_many(&selections).unwrap(), Some(vec![1, 2, 5]));
    }

    #[test]
    fn many_empty_is_none() {
        assert_eq!(parse_ids_many(&[]).unwrap(), None);
    }

    #[test]
    fn array_spec_default_step() {
        let spec = ArraySpec::parse("1-7").unwrap();
        assert_eq!(spec.indices().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn array_spec_with_step() {
        let spec = ArraySpec::parse("1-7:2").unwrap();
        assert_eq!(spec.indices().collect::<Vec<_>>(), vec![1, 3, 5, 7]);
    }

    #[test]
    fn array_spec_rejects_zero_first() {
        assert!(ArraySpec::parse("0-7").is_err());
    }

    #[test]
    fn array_spec_rejects_last_less_than_first() {
        assert!(ArraySpec::parse("7-1").is_err());
    }

    #[test]
    fn array_spec_rejects_zero_step() {
        assert!(ArraySpec::parse("1-7:0").is_err());
    }
}
