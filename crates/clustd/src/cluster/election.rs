//! Pure election and registration rules.
//!
//! Every node runs the same rules over the same inputs, so these functions
//! take plain views of peer state and never touch the network.

use tracing::{debug, warn};

use clustd_common::ClustdError;

/// Election-relevant snapshot of one peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub active: bool,
    pub open: bool,
}

/// Lexicographically smallest id among active, open candidates
pub fn elect(candidates: impl IntoIterator<Item = Candidate>) -> Option<String> {
    candidates
        .into_iter()
        .filter(|c| c.active && c.open)
        .map(|c| c.id)
        .min_by(|a, b| a.cmp(b))
}

/// What is already registered under an id
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Existing {
    /// The record is the very peer being registered
    pub same: bool,
    pub local: bool,
    pub open: bool,
}

/// Outcome of registering a peer under its id
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// Nothing registered yet
    Track,
    /// Already registered as this very peer
    AlreadyTracked,
    /// Replaces a stale record, which is stopped
    Replace,
    /// The id belongs to the local peer
    RejectLocal,
    /// An open connection already exists for the id
    RejectOpen,
}

impl Registration {
    pub fn accepted(self) -> bool {
        matches!(self, Self::Track | Self::AlreadyTracked | Self::Replace)
    }
}

pub fn registration(existing: Option<Existing>) -> Registration {
    match existing {
        None => Registration::Track,
        Some(e) if e.same => Registration::AlreadyTracked,
        Some(e) if e.local => Registration::RejectLocal,
        Some(e) if e.open => Registration::RejectOpen,
        Some(_) => Registration::Replace,
    }
}

/// Agree on the remote master from each responder's answer.
///
/// Null answers and ids that are not known peers are skipped. Every
/// remaining answer must name the same id. Returns `None` when no
/// recognized master is reported.
pub fn reconcile<'a>(
    views: impl IntoIterator<Item = (&'a str, Option<&'a str>)>,
    is_known: impl Fn(&str) -> bool,
) -> Result<Option<String>, ClustdError> {
    let mut agreed: Option<(&str, &str)> = None;

    for (responder, master) in views {
        let Some(master) = master else {
            debug!(peer = %responder, "Peer reports no master");
            continue;
        };
        if !is_known(master) {
            warn!(peer = %responder, master = %master, "Peer reports an unrecognized master");
            continue;
        }
        match agreed {
            None => agreed = Some((responder, master)),
            Some((first, expected)) if expected != master => {
                return Err(ClustdError::Consistency(format!(
                    "{} reports master {} but {} reports {}",
                    first, expected, responder, master
                )));
            }
            Some(_) => {}
        }
    }

    Ok(agreed.map(|(_, master)| master.to_string()))
}
