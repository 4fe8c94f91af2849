//! Target-profile evaluation over named address lists.

use std::collections::{BTreeMap, HashSet};

use shared_types::TargetProfile;

pub type AddressLists = BTreeMap<String, Vec<String>>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("address list not found: {0}")]
    UnknownList(String),

    #[error("invalid target profile: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ProfileError {
    fn from(e: serde_json::Error) -> Self {
        ProfileError::Malformed(e.to_string())
    }
}

/// Evaluate a profile tree. Results never contain duplicates; order follows
/// the left operand first.
pub fn evaluate(profile: &TargetProfile, lists: &AddressLists) -> Result<Vec<String>, ProfileError> {
    match profile {
        TargetProfile::Single(name) => {
            let list = lists
                .get(name)
                .ok_or_else(|| ProfileError::UnknownList(name.clone()))?;
            let mut seen = HashSet::new();
            Ok(list
                .iter()
                .filter(|address| seen.insert(address.as_str()))
                .cloned()
                .collect())
        }
        TargetProfile::Union(left, right) => {
            let mut out = evaluate(left, lists)?;
            let mut seen: HashSet<String> = out.iter().cloned().collect();
            for address in evaluate(right, lists)? {
                if seen.insert(address.clone()) {
                    out.push(address);
                }
            }
            Ok(out)
        }
        TargetProfile::Intersection(left, right) => {
            let right: HashSet<String> = evaluate(right, lists)?.into_iter().collect();
            Ok(evaluate(left, lists)?
                .into_iter()
                .filter(|address| right.contains(address))
                .collect())
        }
    }
}
