//! Prompt rendering for start prompts, wake nudges and patrol molecules.
//!
//! Nudges are typed into a pane, so rendered prompts are collapsed to one
//! line. Patrol text lands in a bead description and keeps its line breaks.

use minijinja::Environment;
use serde::Serialize;

const START_PROMPT_TEMPLATE: &str = include_str!("templates/start-prompt.jinja");
const WAKE_TEMPLATE: &str = include_str!("templates/wake.jinja");
const PATROL_TEMPLATE: &str = include_str!("templates/patrol.jinja");

/// First message typed into a freshly started agent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartPrompt {
    pub bead_id: String,
    pub title: String,
    /// Short subject line given with `--subject`.
    pub subject: Option<String>,
    /// Natural-language instructions stored as `attached_args`.
    pub args: Option<String>,
    pub message: Option<String>,
    pub sender: String,
    /// Attached guidance molecule, if a formula was applied.
    pub molecule: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WakePrompt {
    pub rig: String,
    pub beads: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatrolPrompt {
    pub rig: String,
    pub role: String,
}

fn render<T: Serialize>(name: &str, source: &str, ctx: &T) -> anyhow::Result<String> {
    let mut env = Environment::new();
    env.add_template(name, source)?;
    let template = env.get_template(name)?;
    Ok(template.render(ctx)?)
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn render_start_prompt(prompt: &StartPrompt) -> anyhow::Result<String> {
    Ok(one_line(&render("start-prompt", START_PROMPT_TEMPLATE, prompt)?))
}

pub fn render_wake(prompt: &WakePrompt) -> anyhow::Result<String> {
    Ok(one_line(&render("wake", WAKE_TEMPLATE, prompt)?))
}

pub fn render_patrol(prompt: &PatrolPrompt) -> anyhow::Result<String> {
    Ok(render("patrol", PATROL_TEMPLATE, prompt)?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> StartPrompt {
        StartPrompt {
            bead_id: "gp-abc".into(),
            title: "Fix login".into(),
            sender: "mayor".into(),
            ..StartPrompt::default()
        }
    }

    #[test]
    fn start_prompt_with_args_quotes_them() {
        let text = render_start_prompt(&StartPrompt {
            args: Some("patch the redirect only".into()),
            subject: Some("ignored when args are set".into()),
            ..prompt()
        })
        .unwrap();
        assert!(text.starts_with("Work is on your hook: gp-abc (Fix login)."));
        assert!(text.contains("Instructions: patch the redirect only."));
        assert!(!text.contains("ignored"));
        assert!(!text.contains('\n'));
    }

    #[test]
    fn start_prompt_with_subject_only() {
        let text = render_start_prompt(&StartPrompt {
            subject: Some("Quick look at the flaky test".into()),
            ..prompt()
        })
        .unwrap();
        assert!(text.contains("gp-abc. Quick look at the flaky test."));
        assert!(!text.contains("gt hook"));
    }

    #[test]
    fn bare_start_prompt_points_at_hook() {
        let text = render_start_prompt(&StartPrompt {
            molecule: Some("gp-wisp-1".into()),
            message: Some("low priority".into()),
            ..prompt()
        })
        .unwrap();
        assert!(text.contains("Run `gt hook`"));
        assert!(text.contains("molecule gp-wisp-1"));
        assert!(text.contains("Note from mayor: low priority"));
    }

    #[test]
    fn wake_lists_beads() {
        let text = render_wake(&WakePrompt {
            rig: "gastown".into(),
            beads: vec!["gp-1".into(), "gp-2".into()],
        })
        .unwrap();
        assert_eq!(text, "New polecat work in gastown: gp-1, gp-2. Check your patrol.");
    }

    #[test]
    fn patrol_text_depends_on_role() {
        let witness = render_patrol(&PatrolPrompt {
            rig: "gastown".into(),
            role: "witness".into(),
        })
        .unwrap();
        assert!(witness.contains("reap idle polecats"));
        let refinery = render_patrol(&PatrolPrompt {
            rig: "gastown".into(),
            role: "refinery".into(),
        })
        .unwrap();
        assert!(refinery.contains("needs-rebase"));
    }
}
