//! Prompt templates, one per generation kind.

use anyhow::{Context, Result};
use std::collections::HashMap;

use crate::generation::GenerationKind;

/// System prompts keyed by generation kind.
///
/// Loaded from a map of template name to template text, where the names are
/// the file stems of the `prompts/*.md` files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    pub course_metadata: String,
    pub module_content: String,
}

impl PromptSet {
    pub fn from_map(prompts: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            prompts
                .get(key)
                .cloned()
                .with_context(|| format!("Missing prompt template: '{key}'"))
        };
        Ok(Self {
            course_metadata: get(GenerationKind::CourseMetadata.template_name())?,
            module_content: get(GenerationKind::ModuleContent.template_name())?,
        })
    }

    pub fn for_kind(&self, kind: GenerationKind) -> &str {
        match kind {
            GenerationKind::CourseMetadata => &self.course_metadata,
            GenerationKind::ModuleContent => &self.module_content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_are_looked_up_by_file_stem() {
        let map = HashMap::from([
            ("course_metadata".to_string(), "plan a course".to_string()),
            ("module_content".to_string(), "write a module".to_string()),
            ("unrelated".to_string(), "ignored".to_string()),
        ]);
        let prompts = PromptSet::from_map(&map).unwrap();
        assert_eq!(prompts.for_kind(GenerationKind::ModuleContent), "write a module");
    }

    #[test]
    fn missing_template_is_reported_by_name() {
        let map = HashMap::from([("course_metadata".to_string(), "plan".to_string())]);
        let err = PromptSet::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("module_content"));
    }
}
