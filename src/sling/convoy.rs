//! Convoys: town-level beads that track slung work.

use rand::Rng;
use serde_json::json;

use super::{Sling, SlingError};
use crate::beads::fields::{ConvoyFields, set_convoy_fields};
use crate::beads::{CreateOptions, Db, Issue, IssueType, Status};

pub const CONVOY_PREFIX: &str = "hq-cv-";
pub const TRACKS: &str = "tracks";
const SUFFIX_LEN: usize = 5;

/// `hq-cv-` plus five random base-36 characters.
pub fn new_convoy_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LEN)
        .filter_map(|_| char::from_digit(rng.random_range(0..36), 36))
        .collect();
    format!("{CONVOY_PREFIX}{suffix}")
}

pub fn batch_title(count: usize, rig: &str) -> String {
    let noun = if count == 1 { "bead" } else { "beads" };
    format!("Batch: {count} {noun} to {rig}")
}

impl Sling {
    /// An open convoy already tracking `bead`. Lookup failures read as
    /// untracked.
    pub(super) fn tracking_convoy(&self, bead: &str) -> Option<String> {
        match self.beads.dependents(bead, TRACKS) {
            Ok(found) => found
                .into_iter()
                .find(|i| i.issue_type == IssueType::Convoy && i.status != Status::Closed)
                .map(|i| i.id),
            Err(e) => {
                tracing::warn!(bead, error = %e, "convoy lookup failed");
                None
            }
        }
    }

    fn create_convoy(
        &self,
        title: &str,
        rig: Option<&str>,
        beads: &[&str],
    ) -> Result<String, SlingError> {
        let id = new_convoy_id();
        let fields = ConvoyFields {
            owner: Some(self.actor.clone()),
            rig: rig.map(str::to_string),
            notify: None,
        };
        self.beads.create(
            &Db::Town,
            &CreateOptions {
                id: Some(id.clone()),
                title: title.to_string(),
                description: set_convoy_fields("", &fields),
                issue_type: IssueType::Convoy,
                ..CreateOptions::default()
            },
        )?;
        for bead in beads {
            self.beads.add_dependency(&id, bead, TRACKS)?;
        }
        self.feed
            .record("convoy", &self.actor, json!({ "convoy": id, "tracks": beads }));
        tracing::info!(convoy = %id, title, tracks = beads.len(), "convoy created");
        Ok(id)
    }

    /// The convoy tracking `issue`, creating `Work: <title>` if there is none.
    pub(super) fn ensure_work_convoy(&self, issue: &Issue) -> Result<Option<String>, SlingError> {
        if let Some(existing) = self.tracking_convoy(&issue.id) {
            tracing::debug!(bead = %issue.id, convoy = %existing, "already tracked");
            return Ok(Some(existing));
        }
        let rig = match self.db_of(&issue.id) {
            Db::Rig(rig) => Some(rig),
            Db::Town => None,
        };
        self.create_convoy(&format!("Work: {}", issue.title), rig.as_deref(), &[&issue.id])
            .map(Some)
    }

    /// One convoy for every bead of a batch not already tracked elsewhere.
    pub(super) fn batch_convoy(
        &self,
        rig: &str,
        issues: &[Issue],
    ) -> Result<Option<String>, SlingError> {
        let untracked: Vec<&str> = issues
            .iter()
            .filter(|i| self.tracking_convoy(&i.id).is_none())
            .map(|i| i.id.as_str())
            .collect();
        if untracked.is_empty() {
            return Ok(None);
        }
        self.create_convoy(&batch_title(untracked.len(), rig), Some(rig), &untracked)
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::fields::parse_convoy_fields;
    use crate::sling::SlingRequest;
    use crate::testing::Harness;

    #[test]
    fn convoy_ids_are_short_base36() {
        let id = new_convoy_id();
        let suffix = id.strip_prefix(CONVOY_PREFIX).unwrap();
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn batch_convoy_skips_tracked_beads() {
        let h = Harness::new();
        h.task("gp-1", "one");
        h.task("gp-2", "two");
        let first = h
            .sling()
            .run(&SlingRequest {
                positionals: vec!["gp-1".into(), "gastown".into()],
                ..SlingRequest::default()
            })
            .unwrap()
            .convoy
            .unwrap();

        let batch = h
            .sling()
            .run(&SlingRequest {
                positionals: vec!["gp-1".into(), "gp-2".into(), "gastown".into()],
                force: true,
                ..SlingRequest::default()
            })
            .unwrap()
            .convoy
            .unwrap();
        assert_ne!(first, batch);
        let convoy = h.beads.issue(&batch).unwrap();
        assert_eq!(convoy.title, "Batch: 1 bead to gastown");
        let fields = parse_convoy_fields(&convoy.description);
        assert_eq!(fields.owner.as_deref(), Some("overseer"));
        assert_eq!(fields.rig.as_deref(), Some("gastown"));
        let tracked: Vec<_> = h
            .beads
            .deps()
            .into_iter()
            .filter(|(c, _, _)| *c == batch)
            .map(|(_, on, _)| on)
            .collect();
        assert_eq!(tracked, vec!["gp-2"]);
    }
}
