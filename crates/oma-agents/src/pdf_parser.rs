//! Reads an uploaded PDF and builds a structured content overview from it.

use once_cell::sync::Lazy;
use oma_core::{AgentConfig, AgentDefinition, AgentSpec, OmaError, StepInputs, TaskSpec, WorkflowSpec};
use serde_json::json;

use crate::{DEFAULT_MODEL, DEFAULT_TEMPERATURE};

pub const AGENT_ID: &str = "pdf_parser";

pub const TOOLS: [&str; 4] = [
    "get_pdf_pages",
    "create_content_overview",
    "create_content_section",
    "complete_content_overview",
];

static CONFIG: Lazy<AgentConfig> = Lazy::new(|| {
    AgentConfig::new(AGENT_ID, "PDF Reader & Parser")
        .with_description(
            "Reads a PDF and creates a structured content overview for downstream agents",
        )
        .with_timeout_secs(300)
        .with_retry_count(3)
        .with_input("file_id", "string - manuscript file ID to process")
        .with_optional_input(
            "model",
            "string - LLM model to use",
            Some(json!(DEFAULT_MODEL)),
        )
        .with_output(
            "structured_content_overview_id",
            "string - structured content overview ID",
        )
        .with_estimates(5, 600)
});

#[derive(Debug, Default, Clone, Copy)]
pub struct PdfParser;

impl AgentDefinition for PdfParser {
    fn config(&self) -> &AgentConfig {
        &CONFIG
    }

    fn workflow(&self, inputs: &StepInputs) -> Result<WorkflowSpec, OmaError> {
        let file_id = inputs.str_or("file_id", "");
        let processor = AgentSpec::new(
            "PDF Processor",
            "Get PDF pages via tools and create structured content",
            "You process PDFs efficiently using tools. Your workflow:\n\
             1. Use get_pdf_pages to fetch content and identify sections.\n\
             2. Use create_content_overview to create an overview before adding sections.\n\
             3. Use create_content_section to add sections with extracted content.\n\
             4. Use complete_content_overview to finalize.",
        )
        .with_tools(TOOLS)
        .with_max_iter(20);

        let task = TaskSpec::new(
            "PDF Processor",
            format!(
                "Process the PDF with file_id `{file_id}`. Create the abstract section only, \
                 then finalize the structured content overview."
            ),
            "section name",
        );

        Ok(
            WorkflowSpec::new(AGENT_ID, inputs.str_or("model", DEFAULT_MODEL))
                .with_temperature(DEFAULT_TEMPERATURE)
                .agent(processor)
                .task(task),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oma_core::OmaContext;

    #[test]
    fn config_declares_the_parser_contract() {
        let config = PdfParser.config();
        config.validate().expect("valid config");
        assert_eq!(config.timeout, 300);
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.required_inputs().collect::<Vec<_>>(), vec!["file_id"]);
        assert_eq!(
            config.output_keys().collect::<Vec<_>>(),
            vec!["structured_content_overview_id"]
        );
    }

    #[test]
    fn model_defaults_when_absent() {
        let context = OmaContext::new();
        context.set_shared_data("file_id", "F1");
        let inputs = PdfParser.config().resolve_inputs(&context).unwrap();
        let workflow = PdfParser.workflow(&inputs).unwrap();
        assert_eq!(workflow.model, DEFAULT_MODEL);
        assert_eq!(workflow.tool_names(), TOOLS.to_vec());
        assert!(workflow.tasks[0].description.contains("`F1`"));
        workflow.validate().unwrap();
    }
}
