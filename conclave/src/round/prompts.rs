//! Phase prompt templates.

use crate::session::{CollaborationRequest, Contribution};

const CONFIDENCE_FOOTER: &str =
    "Finish with a line `Confidence: NN` (0-100) rating how sure you are of your answer.";

fn task_header(request: &CollaborationRequest) -> String {
    let mut out = format!(
        "## Task (priority: {})\n\n{}\n",
        request.priority,
        request.prompt.trim()
    );
    if let Some(ctx) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
        out.push_str(&format!("\n## Context\n\n{}\n", ctx.trim()));
    }
    out
}

fn render_contributions(contributions: &[&Contribution]) -> String {
    contributions
        .iter()
        .map(|c| {
            format!(
                "### [{}] {} (round {}, confidence {:.0})\n\n{}",
                c.id,
                c.author_id,
                c.round_number,
                c.confidence,
                c.content.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn propose(request: &CollaborationRequest) -> String {
    format!(
        "{}\n## Instructions\n\n\
         Propose a complete, independent solution to the task. \
         Explain the key decisions briefly.\n\n{}",
        task_header(request),
        CONFIDENCE_FOOTER
    )
}

pub fn critique(request: &CollaborationRequest, previous: &[&Contribution]) -> String {
    format!(
        "{}\n## Proposals under review\n\n{}\n\n## Instructions\n\n\
         Critique every proposal above. Point out defects, risks and missing \
         cases, say what each does well, and describe how you would improve \
         the strongest one.\n\n{}",
        task_header(request),
        render_contributions(previous),
        CONFIDENCE_FOOTER
    )
}

pub fn synthesize(request: &CollaborationRequest, all: &[&Contribution]) -> String {
    format!(
        "{}\n## Collaboration so far\n\n{}\n\n## Instructions\n\n\
         You are the synthesizer. Merge the strongest ideas above into one \
         final solution, resolving the critiques raised. Output the solution \
         itself, not a discussion of it.\n\n{}",
        task_header(request),
        render_contributions(all),
        CONFIDENCE_FOOTER
    )
}

pub fn validate(request: &CollaborationRequest, synthesis: &Contribution) -> String {
    format!(
        "{}\n## Proposed final solution\n\n{}\n\n## Instructions\n\n\
         Validate this solution against the task. List any blocking problems; \
         if there are none, say it is ready.\n\n{}",
        task_header(request),
        render_contributions(&[synthesis]),
        CONFIDENCE_FOOTER
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::session::{ContributionMetadata, Priority};

    fn contribution(id: &str, author: &str, content: &str) -> Contribution {
        Contribution {
            id: id.into(),
            round_id: "r-1".into(),
            round_number: 1,
            author_id: author.into(),
            author_provider: "mock".into(),
            content: content.into(),
            confidence: 80.0,
            build_upon: vec![],
            critiques: vec![],
            timestamp: Utc::now(),
            tokens: 1,
            metadata: ContributionMetadata::default(),
        }
    }

    #[test]
    fn test_propose_includes_task_and_context() {
        let req = CollaborationRequest::new("Build a login form")
            .with_priority(Priority::High)
            .with_context("Use React");
        let prompt = propose(&req);
        assert!(prompt.contains("Build a login form"));
        assert!(prompt.contains("priority: high"));
        assert!(prompt.contains("## Context\n\nUse React"));
        assert!(prompt.contains("Confidence: NN"));
    }

    #[test]
    fn test_critique_embeds_every_proposal() {
        let req = CollaborationRequest::new("Build a login form");
        let a = contribution("c-a", "claude", "Use OAuth");
        let b = contribution("c-b", "gpt", "Use sessions");
        let prompt = critique(&req, &[&a, &b]);
        assert!(prompt.contains("[c-a] claude"));
        assert!(prompt.contains("Use sessions"));
        assert!(!prompt.contains("## Context"));
    }

    #[test]
    fn test_validate_shows_synthesis() {
        let req = CollaborationRequest::new("x");
        let s = contribution("c-s", "claude", "Final answer");
        assert!(validate(&req, &s).contains("Final answer"));
    }
}
