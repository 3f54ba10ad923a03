//! The rig pipeline: one fresh polecat per bead.
//!
//! Everything before the spawn (formulas, metadata, the convoy, name
//! allocation) runs serially on the calling thread. Spawns go through a
//! [`Dispatcher`]; each worker hooks its bead before the polecat's session
//! exists. The rig's witness and refinery are woken once at the end.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use serde_json::json;

use super::convoy::batch_title;
use super::{Assignment, Sling, SlingError, SlingOutcome, SlingRequest};
use crate::address::AgentAddress;
use crate::beads::{Issue, Status};
use crate::dispatch::{DispatchFailure, DispatchReport, Dispatcher, capacity_slots};
use crate::polecat::{AddOptions, add_with_repair};
use crate::queue::QueueItem;
use crate::template::{WakePrompt, render_wake};

/// Result of one dispatch round.
struct Round {
    assigned: Vec<Assignment>,
    report: DispatchReport,
    errors: BTreeMap<String, SlingError>,
}

impl Sling {
    fn parallelism(&self, req: &SlingRequest) -> usize {
        req.parallelism
            .unwrap_or(self.town.config.sling.parallelism)
    }

    /// Polecats across the town whose sessions are alive.
    fn running_polecats(&self) -> usize {
        self.town
            .config
            .rigs
            .keys()
            .flat_map(|rig| {
                self.polecats.list(rig).unwrap_or_else(|e| {
                    tracing::warn!(rig = %rig, error = %e, "could not list polecats");
                    Vec::new()
                })
            })
            .filter(|p| self.sessions.is_alive(&p.session_name))
            .count()
    }

    pub(super) fn sling_to_rig(
        &self,
        rig: &str,
        issues: Vec<Issue>,
        formula: Option<&str>,
        req: &SlingRequest,
    ) -> Result<SlingOutcome, SlingError> {
        if !self.town.has_rig(rig) {
            return Err(SlingError::UnknownRig(rig.to_string()));
        }
        let settings = &self.town.config.sling;
        let formula = formula.map(str::to_string).or_else(|| {
            settings
                .apply_default_formula
                .then(|| settings.default_formula.clone())
                .filter(|f| !f.is_empty())
        });

        // Capacity is checked before anything is written.
        let mut spawn_now = issues.len();
        if !req.queue {
            let (max, explicit) = match req.capacity {
                Some(cap) => (cap, true),
                None => (settings.max_polecats, false),
            };
            if let Some(slots) = capacity_slots(max, self.running_polecats())
                && slots < issues.len()
            {
                if explicit {
                    return Err(SlingError::CapacityExceeded {
                        requested: issues.len(),
                        available: slots,
                        max,
                    });
                }
                tracing::warn!(
                    rig,
                    requested = issues.len(),
                    slots,
                    max_polecats = max,
                    "over capacity, queueing the overflow"
                );
                spawn_now = slots;
            }
        }

        if req.dry_run {
            return Ok(SlingOutcome::planned(self.plan_rig(
                rig,
                &issues,
                formula.as_deref(),
                spawn_now,
                req,
            )));
        }

        self.prepare(&issues, formula.as_deref(), req)?;
        let mut outcome = SlingOutcome::default();
        if !req.no_convoy {
            outcome.convoy = match issues.as_slice() {
                [single] => self.ensure_work_convoy(single)?,
                _ => self.batch_convoy(rig, &issues)?,
            };
        }

        let items: Vec<QueueItem> = issues.iter().map(|i| QueueItem::new(&i.id, rig)).collect();
        if req.queue {
            for item in &items {
                self.queue.add(&item.bead_id, rig)?;
            }
            let drained = self.drain(req)?;
            outcome.assigned = drained.assigned;
            outcome.queued = drained.queued;
            outcome.failed = drained.failed;
            return Ok(outcome);
        }

        let (now, overflow) = items.split_at(spawn_now);
        for item in overflow {
            self.queue.add(&item.bead_id, rig)?;
            outcome.queued.push(item.bead_id.clone());
        }

        let round = self.dispatch_round(now, &Dispatcher::new(self.parallelism(req)), req);
        if items.len() == 1
            && let Some(err) = round.errors.into_values().next()
        {
            return Err(err);
        }
        for assignment in &round.assigned {
            self.dequeue(&assignment.bead);
        }
        outcome.assigned = round.assigned;
        outcome.failed = round.report.failed;
        Ok(outcome)
    }

    fn plan_rig(
        &self,
        rig: &str,
        issues: &[Issue],
        formula: Option<&str>,
        spawn_now: usize,
        req: &SlingRequest,
    ) -> Vec<String> {
        let ids: Vec<&str> = issues.iter().map(|i| i.id.as_str()).collect();
        let mut plan = Vec::new();
        if let Some(f) = formula {
            plan.push(format!("cook {f} and attach a wisp to {}", ids.join(", ")));
        }
        plan.push(format!("record dispatched_by={} on {}", self.actor, ids.join(", ")));
        if !req.no_convoy {
            plan.push(match issues {
                [single] => format!(
                    "track in convoy \"Work: {}\" unless one already tracks {}",
                    single.title, single.id
                ),
                _ => {
                    let untracked = issues
                        .iter()
                        .filter(|i| self.tracking_convoy(&i.id).is_none())
                        .count();
                    if untracked == 0 {
                        "every bead is already tracked by a convoy".to_string()
                    } else {
                        format!("track untracked beads in convoy \"{}\"", batch_title(untracked, rig))
                    }
                }
            });
        }
        if req.queue {
            plan.push(format!("queue {} and drain up to capacity", ids.join(", ")));
        } else {
            for id in &ids[..spawn_now] {
                plan.push(format!("hook {id} to a new polecat in {rig} and start its session"));
            }
            if spawn_now < ids.len() {
                plan.push(format!("queue {} (over capacity)", ids[spawn_now..].join(", ")));
            }
        }
        plan.push(format!("wake {rig} witness and refinery"));
        plan
    }

    /// Dispatch the head of the town queue within capacity.
    ///
    /// Dispatched items leave the queue. Failed items stay with their retry
    /// count bumped until they pass `sling.max_retries`.
    pub(super) fn drain(&self, req: &SlingRequest) -> Result<SlingOutcome, SlingError> {
        let mut items = self.queue.load()?;
        items.retain(|item| !self.owned_elsewhere(item, req.dry_run));
        let mut outcome = SlingOutcome::default();
        if items.is_empty() {
            return Ok(outcome);
        }
        let max = req.capacity.unwrap_or(self.town.config.sling.max_polecats);
        let slots = capacity_slots(max, self.running_polecats());
        let Some(dispatcher) = Dispatcher::new(self.parallelism(req)).with_capacity(slots) else {
            tracing::info!(queued = items.len(), max_polecats = max, "no free polecat slots");
            outcome.queued = items.into_iter().map(|i| i.bead_id).collect();
            return Ok(outcome);
        };
        let head = dispatcher.head(&items);
        if req.dry_run {
            outcome.plan = head
                .iter()
                .map(|i| format!("dispatch queued {} to a new polecat in {}", i.bead_id, i.rig))
                .collect();
            return Ok(outcome);
        }

        let round = self.dispatch_round(head, &dispatcher, req);
        for bead in &round.report.succeeded {
            self.queue.remove(bead)?;
        }
        let max_retries = self.town.config.sling.max_retries;
        for failure in &round.report.failed {
            let permanent = matches!(
                round.errors.get(&failure.bead_id),
                Some(SlingError::InvalidInput(_) | SlingError::BeadAlreadyAssigned { .. })
            );
            let retries = if permanent {
                None
            } else {
                self.queue.increment_retry(&failure.bead_id)?
            };
            if permanent || retries.is_some_and(|n| n > max_retries) {
                self.queue.remove(&failure.bead_id)?;
                tracing::warn!(bead = %failure.bead_id, rig = %failure.rig, retries, error = %failure.error, "dropped from queue");
                self.feed.record(
                    "queue-drop",
                    &self.actor,
                    json!({ "bead": failure.bead_id, "rig": failure.rig, "error": failure.error }),
                );
            }
        }
        outcome.assigned = round.assigned;
        outcome.failed = round.report.failed;
        outcome.queued = self.queue.load()?.into_iter().map(|i| i.bead_id).collect();
        Ok(outcome)
    }

    /// Whether a running agent already owns a queued bead. Such beads leave
    /// the queue (unless this is a dry run) and are never dispatched again.
    fn owned_elsewhere(&self, item: &QueueItem, dry_run: bool) -> bool {
        let issue = match self.beads.try_show(&item.bead_id) {
            Ok(Some(issue)) => issue,
            Ok(None) => return false,
            Err(e) => {
                tracing::debug!(bead = %item.bead_id, error = %e, "could not check queued bead");
                return false;
            }
        };
        let Some(owner) = self.live_owner(&issue) else {
            return false;
        };
        tracing::info!(bead = %item.bead_id, agent = %owner, "already running, not dispatching again");
        if !dry_run {
            self.dequeue(&item.bead_id);
            self.feed.record(
                "queue-drop",
                &self.actor,
                json!({ "bead": item.bead_id, "rig": item.rig, "owner": owner.to_string() }),
            );
        }
        true
    }

    /// Allocate names, spawn in parallel, then wake each rig that got work.
    fn dispatch_round(
        &self,
        items: &[QueueItem],
        dispatcher: &Dispatcher,
        req: &SlingRequest,
    ) -> Round {
        let mut per_rig: BTreeMap<&str, usize> = BTreeMap::new();
        for item in items {
            *per_rig.entry(item.rig.as_str()).or_default() += 1;
        }
        let mut pools: BTreeMap<&str, VecDeque<String>> = BTreeMap::new();
        let mut early_failures = Vec::new();
        for (rig, count) in per_rig {
            match self.polecats.allocate_names(rig, count) {
                Ok(names) => {
                    pools.insert(rig, names.into());
                }
                Err(e) => {
                    tracing::warn!(rig, count, error = %e, "name allocation failed");
                    early_failures.push((rig, e.to_string()));
                }
            }
        }

        let mut names = BTreeMap::new();
        let mut runnable = Vec::new();
        let mut report = DispatchReport::default();
        for item in items {
            match pools.get_mut(item.rig.as_str()).and_then(VecDeque::pop_front) {
                Some(name) => {
                    names.insert(item.bead_id.clone(), name);
                    runnable.push(item.clone());
                }
                None => {
                    let error = early_failures
                        .iter()
                        .find(|(rig, _)| *rig == item.rig)
                        .map_or_else(|| "no polecat name available".to_string(), |(_, e)| e.clone());
                    report.failed.push(DispatchFailure {
                        bead_id: item.bead_id.clone(),
                        rig: item.rig.clone(),
                        error,
                    });
                }
            }
        }

        let assigned = Mutex::new(Vec::new());
        let errors = Mutex::new(BTreeMap::new());
        let dispatched = dispatcher.dispatch(&runnable, |rig, bead| {
            let Some(name) = names.get(bead) else {
                anyhow::bail!("no polecat name allocated for {bead}");
            };
            match self.spawn_one(rig, bead, name, req) {
                Ok(assignment) => {
                    assigned
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(assignment);
                    Ok(())
                }
                Err(e) => {
                    let message = e.to_string();
                    errors
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(bead.to_string(), e);
                    Err(anyhow::anyhow!(message))
                }
            }
        });
        report.succeeded = dispatched.succeeded;
        report.failed.extend(dispatched.failed);

        let mut assigned = assigned.into_inner().unwrap_or_else(PoisonError::into_inner);
        assigned.sort_by_key(|a| items.iter().position(|i| i.bead_id == a.bead));

        let mut woken: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for item in items.iter().filter(|i| report.succeeded.contains(&i.bead_id)) {
            woken.entry(item.rig.as_str()).or_default().push(item.bead_id.clone());
        }
        for (rig, beads) in woken {
            self.wake_rig(rig, beads);
        }

        Round {
            assigned,
            report,
            errors: errors.into_inner().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Hook `bead` to `rig/polecats/name`, create the polecat and start it.
    /// The name is released on any failure.
    fn spawn_one(
        &self,
        rig: &str,
        bead: &str,
        name: &str,
        req: &SlingRequest,
    ) -> Result<Assignment, SlingError> {
        let release = |err: SlingError| {
            self.polecats.release_name(rig, name);
            err
        };
        let spawn_failed = |detail: String| {
            release(SlingError::SpawnFailed {
                bead: bead.to_string(),
                rig: rig.to_string(),
                detail,
            })
        };

        let issue = self.beads.show(bead).map_err(|e| release(e.into()))?;
        if issue.status == Status::Closed {
            return Err(release(SlingError::InvalidInput(format!("bead {bead} is closed"))));
        }
        if !req.force
            && let Some(owner) = self.live_owner(&issue)
        {
            return Err(release(SlingError::BeadAlreadyAssigned {
                bead: bead.to_string(),
                status: issue.status.to_string(),
                assignee: owner.to_string(),
            }));
        }
        let addr = AgentAddress::polecat(rig, name);
        self.hook(bead, &addr).map_err(release)?;

        let opts = AddOptions {
            hook_bead: Some(bead.to_string()),
        };
        let polecat = add_with_repair(self.polecats.as_ref(), rig, name, &opts, &|s| {
            self.sessions.is_alive(s)
        })
        .map_err(|e| spawn_failed(e.to_string()))?;
        tracing::debug!(polecat = %polecat.name, path = %polecat.clone_path.display(), "polecat ready");

        let session = self
            .sessions
            .start(&addr, &req.start_options())
            .map_err(|e| spawn_failed(e.to_string()))?;
        self.record_sling(bead, &addr, None);
        self.nudge_started(&session, &self.start_prompt(&issue, req));
        Ok(Assignment {
            bead: bead.to_string(),
            agent: addr.to_string(),
            session: session.name,
        })
    }

    /// Tell the rig's witness and refinery about new polecats. Best-effort.
    fn wake_rig(&self, rig: &str, beads: Vec<String>) {
        let text = match render_wake(&WakePrompt {
            rig: rig.to_string(),
            beads,
        }) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(rig, error = %e, "wake template failed");
                return;
            }
        };
        let roles = [
            AgentAddress::Witness {
                rig: rig.to_string(),
            },
            AgentAddress::Refinery {
                rig: rig.to_string(),
            },
        ];
        for addr in roles {
            let name = addr.session_name();
            if !self.sessions.is_alive(&name) {
                tracing::debug!(session = %name, "not running, skipping wake");
                continue;
            }
            if let Err(e) = self.sessions.nudge(&name, &text) {
                tracing::warn!(session = %name, error = %e, "wake nudge failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::IssueType;
    use crate::polecat::{PolecatBackend, RemoveOptions};
    use crate::testing::{Harness, quick_config};

    fn request(args: &[&str]) -> SlingRequest {
        SlingRequest {
            positionals: args.iter().map(|s| s.to_string()).collect(),
            ..SlingRequest::default()
        }
    }

    fn seed(h: &Harness, n: usize) {
        for i in 1..=n {
            h.task(&format!("gp-{i}"), &format!("task {i}"));
        }
    }

    #[test]
    fn batch_spawns_one_polecat_per_bead() {
        let h = Harness::new();
        seed(&h, 3);
        h.driver.add_session("gt-gastown-witness", "claude");
        h.driver.add_session("gt-gastown-refinery", "claude");

        let outcome = h
            .sling()
            .run(&SlingRequest {
                parallelism: Some(2),
                ..request(&["gp-1", "gp-2", "gp-3", "gastown"])
            })
            .unwrap();

        let beads: Vec<&str> = outcome.assigned.iter().map(|a| a.bead.as_str()).collect();
        assert_eq!(beads, vec!["gp-1", "gp-2", "gp-3"]);
        let mut agents: Vec<&str> = outcome.assigned.iter().map(|a| a.agent.as_str()).collect();
        agents.sort();
        agents.dedup();
        assert_eq!(agents.len(), 3);
        // three polecats plus the witness and refinery
        assert_eq!(h.driver.agent_count(), 5);

        for a in &outcome.assigned {
            let hooked = h.events.position(&format!("update {} status=hooked", a.bead)).unwrap();
            let started = h.events.position(&format!("session-start {}", a.session)).unwrap();
            assert!(hooked < started, "{} spawned before its hook", a.bead);
            assert_eq!(h.beads.issue(&a.bead).unwrap().assignee(), Some(a.agent.as_str()));
        }

        let convoys: Vec<Issue> = h
            .beads
            .issues()
            .into_iter()
            .filter(|i| i.issue_type == IssueType::Convoy)
            .collect();
        assert_eq!(convoys.len(), 1);
        assert_eq!(convoys[0].title, "Batch: 3 beads to gastown");
        assert_eq!(h.driver.nudges_to("gt-gastown-witness").len(), 1);
        assert_eq!(h.driver.nudges_to("gt-gastown-refinery").len(), 1);
        assert!(h.driver.nudges_to("gt-gastown-witness")[0].contains("gp-1, gp-2, gp-3"));
    }

    #[test]
    fn one_failure_does_not_cancel_the_batch() {
        let h = Harness::new();
        seed(&h, 3);
        h.backend.break_name("slit");
        let outcome = h
            .sling()
            .run(&request(&["gp-1", "gp-2", "gp-3", "gastown"]))
            .unwrap();
        assert_eq!(outcome.assigned.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].bead_id, "gp-2");
        assert_eq!(h.beads.issue("gp-2").unwrap().status, Status::Hooked);
        assert!(!h.backend.reserved("gastown").contains(&"slit".to_string()));
    }

    #[test]
    fn queue_respects_capacity_and_drains_later() {
        let h = Harness::new();
        seed(&h, 4);
        let queued = SlingRequest {
            queue: true,
            capacity: Some(2),
            ..request(&["gp-1", "gp-2", "gp-3", "gp-4", "gastown"])
        };
        let outcome = h.sling().run(&queued).unwrap();
        assert_eq!(outcome.assigned.len(), 2);
        assert_eq!(h.queued(), vec!["gp-3", "gp-4"]);
        assert_eq!(outcome.queued, vec!["gp-3", "gp-4"]);
        assert_eq!(h.beads.issue("gp-3").unwrap().status, Status::Open);

        // One polecat finishes.
        let done = outcome.assigned[0].agent.rsplit('/').next().unwrap().to_string();
        h.backend
            .remove("gastown", &done, &RemoveOptions::default())
            .unwrap();
        h.driver.remove_session(&outcome.assigned[0].session);

        let drained = h
            .sling()
            .run(&SlingRequest {
                queue: true,
                capacity: Some(2),
                ..SlingRequest::default()
            })
            .unwrap();
        assert_eq!(drained.assigned.len(), 1);
        assert_eq!(drained.assigned[0].bead, "gp-3");
        assert_eq!(h.queued(), vec!["gp-4"]);
    }

    #[test]
    fn full_capacity_leaves_queue_alone() {
        let h = Harness::new();
        seed(&h, 1);
        h.backend.seed("gastown", "toast");
        h.driver.add_session("gt-gastown-toast", "claude");
        let outcome = h
            .sling()
            .run(&SlingRequest {
                queue: true,
                capacity: Some(1),
                ..request(&["gp-1", "gastown"])
            })
            .unwrap();
        assert!(outcome.assigned.is_empty());
        assert_eq!(outcome.queued, vec!["gp-1"]);
        assert_eq!(h.driver.starts(), 0);
    }

    #[test]
    fn explicit_capacity_is_a_hard_limit() {
        let h = Harness::new();
        seed(&h, 2);
        let err = h
            .sling()
            .run(&SlingRequest {
                capacity: Some(1),
                ..request(&["gp-1", "gp-2", "gastown"])
            })
            .unwrap_err();
        assert!(matches!(err, SlingError::CapacityExceeded { requested: 2, available: 1, .. }));
        assert_eq!(err.exit_code(), 13);
        assert!(h.beads.mutations().is_empty());
    }

    #[test]
    fn configured_capacity_queues_the_overflow() {
        let mut config = quick_config();
        config.sling.max_polecats = 1;
        let h = Harness::with_config(config);
        seed(&h, 2);
        let outcome = h.sling().run(&request(&["gp-1", "gp-2", "gastown"])).unwrap();
        assert_eq!(outcome.assigned.len(), 1);
        assert_eq!(outcome.assigned[0].bead, "gp-1");
        assert_eq!(outcome.queued, vec!["gp-2"]);
        assert_eq!(h.queued(), vec!["gp-2"]);
    }

    #[test]
    fn repeated_failures_drop_from_queue() {
        let mut config = quick_config();
        config.sling.max_retries = 1;
        let h = Harness::with_config(config);
        seed(&h, 1);
        h.backend.break_name("nux");
        h.queue().add("gp-1", "gastown").unwrap();
        let drain = SlingRequest {
            queue: true,
            ..SlingRequest::default()
        };

        let first = h.sling().run(&drain).unwrap();
        assert_eq!(first.failed.len(), 1);
        assert_eq!(h.queue().load().unwrap()[0].retry_count, 1);

        h.sling().run(&drain).unwrap();
        assert!(h.queued().is_empty());
        assert!(h.feed().read_all().iter().any(|e| e.kind == "queue-drop"));
    }

    #[test]
    fn direct_sling_takes_the_bead_out_of_the_queue() {
        let h = Harness::new();
        seed(&h, 2);
        h.queue().add("gp-1", "gastown").unwrap();
        h.queue().add("gp-2", "gastown").unwrap();

        let direct = h.sling().run(&request(&["gp-1", "gastown"])).unwrap();
        assert_eq!(direct.assigned[0].agent, "gastown/polecats/nux");
        assert_eq!(h.queued(), vec!["gp-2"]);

        let drained = h
            .sling()
            .run(&SlingRequest {
                queue: true,
                ..SlingRequest::default()
            })
            .unwrap();
        let beads: Vec<&str> = drained.assigned.iter().map(|a| a.bead.as_str()).collect();
        assert_eq!(beads, vec!["gp-2"]);
        assert_eq!(
            h.beads.issue("gp-1").unwrap().assignee(),
            Some("gastown/polecats/nux")
        );
    }

    #[test]
    fn drain_never_dispatches_a_running_bead_twice() {
        let h = Harness::new();
        seed(&h, 1);
        h.sling().run(&request(&["gp-1", "gastown"])).unwrap();
        // Queued again by someone racing the direct sling.
        h.queue().add("gp-1", "gastown").unwrap();
        let starts = h.driver.starts();

        let drain = SlingRequest {
            queue: true,
            ..SlingRequest::default()
        };
        let dry = h
            .sling()
            .run(&SlingRequest {
                dry_run: true,
                ..drain.clone()
            })
            .unwrap();
        assert!(dry.plan.is_empty());
        assert_eq!(h.queued(), vec!["gp-1"]);

        let drained = h.sling().run(&drain).unwrap();
        assert!(drained.assigned.is_empty());
        assert!(drained.failed.is_empty());
        assert!(h.queued().is_empty());
        assert_eq!(h.driver.starts(), starts);
        assert_eq!(
            h.beads.issue("gp-1").unwrap().assignee(),
            Some("gastown/polecats/nux")
        );
        assert!(h.feed().read_all().iter().any(|e| e.kind == "queue-drop"));
    }

    #[test]
    fn drain_redispatches_a_bead_whose_owner_died() {
        let h = Harness::new();
        seed(&h, 1);
        let first = h.sling().run(&request(&["gp-1", "gastown"])).unwrap();
        h.driver.remove_session(&first.assigned[0].session);
        h.queue().add("gp-1", "gastown").unwrap();

        let drained = h
            .sling()
            .run(&SlingRequest {
                queue: true,
                ..SlingRequest::default()
            })
            .unwrap();
        assert_eq!(drained.assigned.len(), 1);
        assert_ne!(drained.assigned[0].agent, "gastown/polecats/nux");
        assert!(h.queued().is_empty());
    }

    #[test]
    fn default_formula_applies_when_enabled() {
        let mut config = quick_config();
        config.sling.apply_default_formula = true;
        config.sling.default_formula = "mol-polecat-work".into();
        let h = Harness::with_config(config).with_beads(|b| b.with_formula("mol-polecat-work", &["work"]));
        seed(&h, 1);
        h.sling().run(&request(&["gp-1", "gastown"])).unwrap();
        assert_eq!(h.beads.cooked(), vec!["mol-polecat-work"]);
    }
}
