//! Compares a parsed paper against related literature.

use once_cell::sync::Lazy;
use oma_core::{AgentConfig, AgentDefinition, AgentSpec, OmaError, StepInputs, TaskSpec, WorkflowSpec};
use serde_json::json;

use crate::{DEFAULT_MODEL, DEFAULT_TEMPERATURE};

pub const AGENT_ID: &str = "comparative_analysis";

pub const TOOLS: [&str; 7] = [
    "get_content_section_list",
    "get_content_section_detail",
    "search_articles",
    "get_article",
    "create_analysis_overview",
    "create_analysis_section",
    "complete_analysis_overview",
];

const MAX_ITER: usize = 60;

const BACKSTORY: &str = "You are an academic researcher specializing in comparative analysis of \
scholarly articles. Read specific sections of a given paper, search for related articles and \
compare approach, methodology, findings and novelty against them.\n\
Your workflow:\n\
1. Use get_content_section_list to get available sections.\n\
2. Use get_content_section_detail to read section detail.\n\
3. Use search_articles with related keywords to find academic articles.\n\
4. Use get_article to read the abstract of selected articles by DOI. If that fails or there is \
no abstract, try another article (at most 20 tries).\n\
5. Use create_analysis_overview ONCE with analysis_type='comparative_analysis'.\n\
6. Use create_analysis_section for each compared article with analysis_type='comparative_analysis', \
using the compared article's title as section title. Compare 5-10 articles if possible.\n\
7. Use complete_analysis_overview with analysis_type='comparative_analysis' to finalize.";

static CONFIG: Lazy<AgentConfig> = Lazy::new(|| {
    AgentConfig::new(AGENT_ID, "Content Analyzer & Searcher")
        .with_description(
            "Reads content sections, searches related articles and writes a comparative analysis",
        )
        .with_timeout_secs(600)
        .with_retry_count(3)
        .with_input(
            "structured_content_overview_id",
            "string - structured content overview ID from the parser step",
        )
        .with_optional_input(
            "model",
            "string - LLM model to use",
            Some(json!(DEFAULT_MODEL)),
        )
        .with_output(
            "comparative_analysis_id",
            "string - analysis result ID with search findings",
        )
        .with_estimates(7, 600)
});

#[derive(Debug, Default, Clone, Copy)]
pub struct ComparativeAnalysis;

impl AgentDefinition for ComparativeAnalysis {
    fn config(&self) -> &AgentConfig {
        &CONFIG
    }

    fn workflow(&self, inputs: &StepInputs) -> Result<WorkflowSpec, OmaError> {
        let overview_id = inputs.str_or("structured_content_overview_id", "");
        let analyst = AgentSpec::new(
            "Comparative Analysis Agent",
            "Read content sections via tools, search related articles and create a comparative \
             analysis between the source content and those articles",
            BACKSTORY,
        )
        .with_tools(TOOLS)
        .with_max_iter(MAX_ITER);

        let task = TaskSpec::new(
            "Comparative Analysis Agent",
            format!(
                "Use the content reader tools on overview `{overview_id}` to read the abstract, \
                 introduction or summary section and the reference section of the paper, then do \
                 a quick comparative analysis."
            ),
            "summary of successfully compared articles and section statistics",
        );

        Ok(
            WorkflowSpec::new(AGENT_ID, inputs.str_or("model", DEFAULT_MODEL))
                .with_temperature(DEFAULT_TEMPERATURE)
                .with_max_steps(MAX_ITER)
                .agent(analyst)
                .task(task),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oma_core::OmaContext;

    #[test]
    fn config_declares_the_analysis_contract() {
        let config = ComparativeAnalysis.config();
        config.validate().expect("valid config");
        assert_eq!(config.timeout, 600);
        assert_eq!(config.estimated_tools_cnt, 7);
        assert_eq!(
            config.required_inputs().collect::<Vec<_>>(),
            vec!["structured_content_overview_id"]
        );
    }

    #[test]
    fn workflow_is_bounded_and_names_every_tool() {
        let context = OmaContext::new();
        context.set_shared_data("structured_content_overview_id", "SCO-1");
        context.set_shared_data("model", "openrouter/anthropic/claude-3.5-sonnet");
        let inputs = ComparativeAnalysis.config().resolve_inputs(&context).unwrap();
        let workflow = ComparativeAnalysis.workflow(&inputs).unwrap();
        assert_eq!(workflow.model, "openrouter/anthropic/claude-3.5-sonnet");
        assert_eq!(workflow.max_steps, MAX_ITER);
        assert_eq!(workflow.agents[0].max_iter, MAX_ITER);
        assert_eq!(workflow.tool_names().len(), TOOLS.len());
    }
}
