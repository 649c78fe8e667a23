use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use stow_codec::{decode_record, referenced_oids};
use stow_dictionary::TypeDictionary;
use stow_registry::ObjectRegistry;
use stow_storage::StorageSystem;
use stow_types::Oid;
use tracing::{info, warn};

use crate::error::EngineResult;

/// Something wrong with the stored graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum IntegrityProblem {
    /// A live record that does not decode under the current dictionary.
    Undecodable {
        oid: Oid,
        file: u64,
        offset: u64,
        reason: String,
    },
    /// A live record refers to an OID that is not stored.
    DanglingReference { from: Oid, to: Oid },
    /// The root pointer names an OID that is not stored.
    MissingRoot { target: Oid },
}

impl fmt::Display for IntegrityProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undecodable {
                oid,
                file,
                offset,
                reason,
            } => write!(f, "record {oid} in file {file} at {offset} does not decode: {reason}"),
            Self::DanglingReference { from, to } => write!(f, "record {from} refers to missing {to}"),
            Self::MissingRoot { target } => write!(f, "root {target} is not stored"),
        }
    }
}

/// Outcome of walking every live record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub records_checked: usize,
    pub references_checked: usize,
    pub problems: Vec<IntegrityProblem>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Decode every live record and follow every reference it holds.
pub(crate) fn check(
    storage: &StorageSystem,
    dictionary: &TypeDictionary,
    registry: &ObjectRegistry,
) -> EngineResult<IntegrityReport> {
    let live: HashSet<Oid> = storage.live_oids()?.into_iter().collect();
    let mut report = IntegrityReport::default();

    for channel in 0..storage.channel_count() {
        for view in storage.records(channel)? {
            let record = &view.record;
            if !view.live || record.is_tombstone() {
                continue;
            }
            if record.oid == Oid::ROOTS {
                match record.root_target() {
                    Some(target) if target.is_null() || live.contains(&target) => {}
                    Some(target) => report.problems.push(IntegrityProblem::MissingRoot { target }),
                    None => report.problems.push(IntegrityProblem::Undecodable {
                        oid: record.oid,
                        file: view.file,
                        offset: view.offset,
                        reason: "malformed root pointer".into(),
                    }),
                }
                continue;
            }

            report.records_checked += 1;
            let decoded = decode_record(record, dictionary, registry).and_then(|_| referenced_oids(record, dictionary));
            let targets = match decoded {
                Ok(targets) => targets,
                Err(e) => {
                    report.problems.push(IntegrityProblem::Undecodable {
                        oid: record.oid,
                        file: view.file,
                        offset: view.offset,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            for to in targets {
                report.references_checked += 1;
                if !to.is_reserved() && !live.contains(&to) {
                    report.problems.push(IntegrityProblem::DanglingReference { from: record.oid, to });
                }
            }
        }
    }

    if report.is_clean() {
        info!(
            records = report.records_checked,
            references = report.references_checked,
            "integrity check passed"
        );
    } else {
        warn!(problems = report.problems.len(), "integrity check found problems");
    }
    Ok(report)
}
