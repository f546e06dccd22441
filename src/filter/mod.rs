//! DNS query filtering module.
//!
//! Blocks ad/tracking domains by checking the names extracted from a query
//! against a periodically refreshed blacklist.

mod blacklist;
pub mod sources;

pub use blacklist::{Blacklist, RefreshOutcome};
pub use sources::{BlacklistSource, ListFormat};

use crate::dns::extract_domain_names;

/// Result of checking a query against the blacklist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The query asks for a blacklisted name.
    Blocked { domain: String },
    /// The query should be forwarded. `domain` is empty for non-A queries.
    Allowed { domain: String },
}

/// Classify a raw query against the blacklist.
pub fn filter_query(blacklist: &Blacklist, query: &[u8]) -> Verdict {
    let names = extract_domain_names(query);
    let domain = names.first().cloned().unwrap_or_default();

    if blacklist.contains(names.as_slice()) {
        Verdict::Blocked { domain }
    } else {
        Verdict::Allowed { domain }
    }
}
