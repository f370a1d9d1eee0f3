//! Batch descriptors parsed from object-store keys.
//!
//! Batches live at `<aggregation-id>/YYYY/MM/DD/HH/MM/<batch-uuid>.<suffix>`
//! with three sibling objects per batch. A batch is *ready* once all three
//! siblings exist for the requested infix: `<infix>`, `<infix>.avro` and
//! `<infix>.sig`. Intake listings use the infix `batch`; validation listings
//! use `validity_0` or `validity_1` depending on which party produced them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::{Error, Result};
use tally_core::clock::{Interval, TIMESTAMP_FORMAT};

/// Descriptor for one batch, parsed from its object keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPath {
    /// Logical stream identifier; user-supplied, arbitrary string.
    pub aggregation_id: String,
    /// Batch timestamp, UTC minute precision.
    pub time: DateTime<Utc>,
    /// Batch UUID string.
    pub id: String,
}

impl fmt::Display for BatchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.aggregation_id,
            self.time.format(TIMESTAMP_FORMAT),
            self.id
        )
    }
}

impl BatchPath {
    /// Parses a key stem of the form
    /// `<aggregation-id>/<yyyy>/<mm>/<dd>/<hh>/<mm>/<batch-uuid>`.
    ///
    /// Returns `Ok(None)` for stems that do not have the expected segment
    /// count (unrelated objects such as task markers). A stem with the right
    /// shape but unparseable timestamp segments is an error.
    fn parse(stem: &str) -> Result<Option<Self>> {
        let segments: Vec<&str> = stem.split('/').collect();
        let &[aggregation_id, year, month, day, hour, minute, id] = segments.as_slice() else {
            return Ok(None);
        };

        let time = parse_time_segments(year, month, day, hour, minute).ok_or_else(|| {
            Error::BatchPath {
                key: stem.to_owned(),
                message: "timestamp segments are not a valid UTC minute".to_owned(),
            }
        })?;

        Ok(Some(Self {
            aggregation_id: aggregation_id.to_owned(),
            time,
            id: id.to_owned(),
        }))
    }
}

fn parse_time_segments(
    year: &str,
    month: &str,
    day: &str,
    hour: &str,
    minute: &str,
) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(
        year.parse().ok()?,
        month.parse().ok()?,
        day.parse().ok()?,
    )?;
    let time = date.and_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0)?;
    Some(time.and_utc())
}

/// Which of the three sibling objects a key represents.
enum Sibling {
    Metadata,
    Avro,
    Signature,
}

#[derive(Default)]
struct Completeness {
    metadata: bool,
    avro: bool,
    signature: bool,
}

impl Completeness {
    fn observe(&mut self, sibling: &Sibling) {
        match sibling {
            Sibling::Metadata => self.metadata = true,
            Sibling::Avro => self.avro = true,
            Sibling::Signature => self.signature = true,
        }
    }

    fn is_complete(&self) -> bool {
        self.metadata && self.avro && self.signature
    }
}

/// Returns the batches for which all three sibling objects with the given
/// infix exist in the listing.
///
/// Keys that do not end in one of the three sibling suffixes, and keys whose
/// stem does not match the batch layout, are skipped silently. Incomplete
/// triplets are dropped. Duplicate descriptors collapse to one. Output order
/// is deterministic (sorted by key stem).
///
/// # Errors
///
/// Returns an error if a batch-shaped key carries an unparseable timestamp.
pub fn ready_batches(files: &[String], infix: &str) -> Result<Vec<BatchPath>> {
    let metadata_suffix = format!(".{infix}");
    let avro_suffix = format!(".{infix}.avro");
    let signature_suffix = format!(".{infix}.sig");

    let mut seen: BTreeMap<String, (BatchPath, Completeness)> = BTreeMap::new();
    for name in files {
        let (stem, sibling) = if let Some(stem) = name.strip_suffix(&avro_suffix) {
            (stem, Sibling::Avro)
        } else if let Some(stem) = name.strip_suffix(&signature_suffix) {
            (stem, Sibling::Signature)
        } else if let Some(stem) = name.strip_suffix(&metadata_suffix) {
            (stem, Sibling::Metadata)
        } else {
            continue;
        };

        if !seen.contains_key(stem) {
            let Some(path) = BatchPath::parse(stem)? else {
                continue;
            };
            seen.insert(stem.to_owned(), (path, Completeness::default()));
        }
        if let Some((_, completeness)) = seen.get_mut(stem) {
            completeness.observe(&sibling);
        }
    }

    Ok(seen
        .into_values()
        .filter(|(_, completeness)| completeness.is_complete())
        .map(|(path, _)| path)
        .collect())
}

/// Retains the batches whose time falls within the half-open interval.
#[must_use]
pub fn within_interval(batches: Vec<BatchPath>, interval: &Interval) -> Vec<BatchPath> {
    batches
        .into_iter()
        .filter(|batch| interval.contains(batch.time))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn siblings(stem: &str, infix: &str) -> Vec<String> {
        vec![
            format!("{stem}.{infix}"),
            format!("{stem}.{infix}.avro"),
            format!("{stem}.{infix}.sig"),
        ]
    }

    #[test]
    fn complete_triplet_is_ready() {
        let files = siblings("agg1/2021/04/02/10/00/uuid-AAAA", "batch");
        let batches = ready_batches(&files, "batch").expect("should parse");

        assert_eq!(
            batches,
            vec![BatchPath {
                aggregation_id: "agg1".to_owned(),
                time: Utc.with_ymd_and_hms(2021, 4, 2, 10, 0, 0).unwrap(),
                id: "uuid-AAAA".to_owned(),
            }]
        );
    }

    #[test]
    fn incomplete_triplet_is_ignored() {
        let files = vec![
            "agg1/2021/04/02/10/00/uuid-AAAA.batch".to_owned(),
            "agg1/2021/04/02/10/00/uuid-AAAA.batch.avro".to_owned(),
        ];
        assert!(ready_batches(&files, "batch")
            .expect("should parse")
            .is_empty());
    }

    #[test]
    fn unrelated_keys_are_skipped() {
        let mut files = siblings("agg1/2021/04/02/10/00/uuid-AAAA", "validity_0");
        files.push("task-markers/intake-agg1-2021-04-02-10-00-uuid-AAAA".to_owned());
        files.push("agg1/2021/04/02/10/00/uuid-AAAA.validity_1".to_owned());
        files.push("not-a-batch".to_owned());

        let batches = ready_batches(&files, "validity_0").expect("should parse");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].id, "uuid-AAAA");
    }

    #[test]
    fn wrong_segment_count_is_skipped() {
        let files = siblings("agg1/extra/2021/04/02/10/00/uuid-AAAA", "batch");
        assert!(ready_batches(&files, "batch")
            .expect("should parse")
            .is_empty());
    }

    #[test]
    fn bad_timestamp_fails_the_listing() {
        let files = siblings("agg1/2021/13/02/10/00/uuid-AAAA", "batch");
        let result = ready_batches(&files, "batch");
        assert!(matches!(result, Err(Error::BatchPath { .. })));
    }

    #[test]
    fn duplicate_descriptors_collapse() {
        let mut files = siblings("agg1/2021/04/02/10/00/uuid-AAAA", "batch");
        files.extend(siblings("agg1/2021/04/02/10/00/uuid-AAAA", "batch"));
        assert_eq!(ready_batches(&files, "batch").expect("should parse").len(), 1);
    }

    #[test]
    fn output_is_sorted_by_stem() {
        let mut files = siblings("agg2/2021/04/02/10/00/uuid-B", "batch");
        files.extend(siblings("agg1/2021/04/02/10/00/uuid-A", "batch"));

        let batches = ready_batches(&files, "batch").expect("should parse");
        assert_eq!(batches[0].aggregation_id, "agg1");
        assert_eq!(batches[1].aggregation_id, "agg2");
    }

    #[test]
    fn within_interval_is_half_open() {
        let at = |h: u32, m: u32| Utc.with_ymd_and_hms(2021, 4, 2, h, m, 0).unwrap();
        let batch = |h: u32| BatchPath {
            aggregation_id: "agg1".to_owned(),
            time: at(h, 0),
            id: format!("uuid-{h}"),
        };
        let interval = Interval::new(at(6, 0), at(9, 0));

        let kept = within_interval(vec![batch(5), batch(6), batch(8), batch(9)], &interval);
        let hours: Vec<u32> = kept.iter().map(|b| b.time.format("%H").to_string().parse().unwrap()).collect();
        assert_eq!(hours, vec![6, 8]);
    }
}
