//! Formulas: templated work plans instantiated as wisps.
//!
//! A formula applied with `--on` is guidance. The wisp root is recorded on
//! the base bead as `attached_molecule` and is never bonded as a blocker, so
//! the base bead keeps showing up as ready work.

use std::collections::BTreeSet;

use super::{Sling, SlingError, Target};
use crate::beads::{Db, Issue};

/// Database that wisps for `target` are created in.
pub fn db_for(target: &Target) -> Db {
    target
        .rig()
        .map_or(Db::Town, |rig| Db::Rig(rig.to_string()))
}

fn cook_once(
    sling: &Sling,
    db: &Db,
    formula: &str,
    cooked: &mut BTreeSet<String>,
) -> Result<(), SlingError> {
    let key = format!("{db:?}/{formula}");
    if cooked.contains(&key) {
        return Ok(());
    }
    if !sling.beads.formula_exists(db, formula)? {
        return Err(SlingError::InvalidInput(format!("unknown formula {formula}")));
    }
    sling.beads.cook_formula(db, formula)?;
    cooked.insert(key);
    Ok(())
}

/// Instantiate `formula` for `issue` and return the wisp root ID.
pub(crate) fn apply(
    sling: &Sling,
    formula: &str,
    issue: &Issue,
    db: &Db,
    vars: &[(String, String)],
    cooked: &mut BTreeSet<String>,
) -> Result<String, SlingError> {
    cook_once(sling, db, formula, cooked)?;
    let mut all = vec![
        ("issue".to_string(), issue.id.clone()),
        ("title".to_string(), issue.title.clone()),
    ];
    all.extend(vars.iter().cloned());
    let root = sling.beads.instantiate_wisp(db, formula, &all)?;
    tracing::info!(bead = %issue.id, formula, molecule = %root, "formula attached");
    Ok(root)
}

/// `gt sling <formula> [target]`: the wisp root becomes the work itself.
pub(crate) fn instantiate_standalone(
    sling: &Sling,
    formula: &str,
    target: &Target,
    vars: &[(String, String)],
) -> Result<String, SlingError> {
    let db = db_for(target);
    cook_once(sling, &db, formula, &mut BTreeSet::new())?;
    let root = sling.beads.instantiate_wisp(&db, formula, vars)?;
    tracing::info!(formula, root = %root, target = %target, "formula instantiated");
    Ok(root)
}
