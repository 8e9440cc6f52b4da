use std::collections::HashMap;
use tracing::debug;

use super::{Condition, DataFilter, PageActionType, ScraperInstruction, ScraperValue, SystemActionType};

/// Load-time validator for instruction programs
///
/// Collects every issue instead of stopping at the first, so a caller can
/// report the whole list at once.
pub struct ProgramValidator {
    issues: Vec<String>,
}

impl Default for ProgramValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramValidator {
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Validates a program and returns its marker table
    pub fn validate(mut self, instructions: &[ScraperInstruction]) -> Result<HashMap<String, usize>, Vec<String>> {
        debug!("Validating program with {} instructions", instructions.len());

        let markers = self.collect_markers(instructions);

        for (index, instruction) in instructions.iter().enumerate() {
            self.validate_instruction(index, instruction, &markers);

            for value in instruction.values() {
                self.validate_value(index, value);
            }
        }

        if self.issues.is_empty() {
            debug!("Program validation passed");
            Ok(markers)
        } else {
            Err(self.issues)
        }
    }

    fn issue(&mut self, index: usize, message: impl AsRef<str>) {
        self.issues.push(format!("instruction {}: {}", index, message.as_ref()));
    }

    fn collect_markers(&mut self, instructions: &[ScraperInstruction]) -> HashMap<String, usize> {
        let mut markers = HashMap::new();

        for (index, instruction) in instructions.iter().enumerate() {
            if let ScraperInstruction::Marker { name } = instruction {
                if name.trim().is_empty() {
                    self.issue(index, "marker name cannot be empty");
                } else if let Some(first) = markers.get(name) {
                    self.issue(index, format!("duplicate marker '{}' (first defined at {})", name, first));
                } else {
                    markers.insert(name.clone(), index);
                }
            }
        }

        markers
    }

    fn validate_instruction(&mut self, index: usize, instruction: &ScraperInstruction, markers: &HashMap<String, usize>) {
        match instruction {
            ScraperInstruction::PageAction { action, .. } => self.validate_page_action(index, action),
            ScraperInstruction::Condition { condition, jump_to } => {
                self.validate_condition(index, condition);
                if let Some(target) = jump_to {
                    self.validate_target(index, target, markers);
                }
            }
            ScraperInstruction::Jump { marker, condition } => {
                self.validate_target(index, marker, markers);
                if let Some(condition) = condition {
                    self.validate_condition(index, condition);
                }
            }
            ScraperInstruction::SaveData { store, column, .. } => {
                self.validate_identifier(index, "store", store);
                self.validate_identifier(index, "column", column);
            }
            ScraperInstruction::SaveDataBatch { store, items } => {
                self.validate_identifier(index, "store", store);
                if items.is_empty() {
                    self.issue(index, "SaveDataBatch requires at least one item");
                }
                let mut seen = std::collections::HashSet::new();
                for item in items {
                    self.validate_identifier(index, "column", &item.column);
                    if !seen.insert(item.column.as_str()) {
                        self.issue(index, format!("column '{}' appears twice in batch", item.column));
                    }
                }
            }
            ScraperInstruction::DeleteData { store, filters } => {
                self.validate_identifier(index, "store", store);
                self.validate_filters(index, filters);
            }
            ScraperInstruction::SystemAction { action } => {
                if let SystemActionType::ExecuteSystemCommand { command, .. } = action {
                    if command.trim().is_empty() {
                        self.issue(index, "system command cannot be empty");
                    }
                }
            }
            ScraperInstruction::DeleteCookies { .. } | ScraperInstruction::Marker { .. } => {}
        }
    }

    fn validate_page_action(&mut self, index: usize, action: &PageActionType) {
        let timeout = match action {
            PageActionType::Navigate { timeout_ms, .. } => *timeout_ms,
            PageActionType::Wait {
                duration_ms,
                selector,
                timeout_ms,
            } => {
                if duration_ms.is_none() && selector.is_none() {
                    self.issue(index, "Wait requires durationMs or selector");
                }
                if let Some(selector) = selector {
                    self.validate_selector(index, selector);
                }
                *timeout_ms
            }
            PageActionType::Click {
                selector,
                smart_fallback,
                timeout_ms,
            } => {
                self.validate_selector(index, selector);
                if smart_fallback.as_deref().is_some_and(|d| d.trim().is_empty()) {
                    self.issue(index, "smartFallback description cannot be empty");
                }
                *timeout_ms
            }
            PageActionType::SmartClick { description } => {
                if description.trim().is_empty() {
                    self.issue(index, "SmartClick description cannot be empty");
                }
                None
            }
            PageActionType::Type {
                selector, timeout_ms, ..
            } => {
                self.validate_selector(index, selector);
                *timeout_ms
            }
            PageActionType::ScrollToElement { selector } => {
                self.validate_selector(index, selector);
                None
            }
            PageActionType::Evaluate { script } => {
                if script.trim().is_empty() {
                    self.issue(index, "Evaluate script cannot be empty");
                }
                None
            }
            PageActionType::ScrollToBottom | PageActionType::ScrollToTop => None,
        };

        if timeout == Some(0) {
            self.issue(index, format!("{} timeoutMs must be > 0", action.name()));
        }
    }

    fn validate_condition(&mut self, index: usize, condition: &Condition) {
        if let Err(message) = condition.condition_type.check_arity(condition.right.len()) {
            self.issue(index, message);
        }
    }

    fn validate_filters(&mut self, index: usize, filters: &[DataFilter]) {
        for filter in filters {
            self.validate_identifier(index, "column", &filter.column);
            if let Err(message) = filter.condition_type.check_arity(filter.values.len()) {
                self.issue(index, format!("filter on '{}': {}", filter.column, message));
            }
        }
    }

    fn validate_value(&mut self, index: usize, value: &ScraperValue) {
        match value {
            ScraperValue::ExternalData {
                store,
                column,
                filters,
                ..
            } => {
                self.validate_identifier(index, "store", store);
                self.validate_identifier(index, "column", column);
                self.validate_filters(index, filters);
            }
            ScraperValue::ElementTextContent { selector, .. } => self.validate_selector(index, selector),
            ScraperValue::ElementAttribute {
                selector, attribute, ..
            } => {
                self.validate_selector(index, selector);
                if attribute.trim().is_empty() {
                    self.issue(index, "attribute name cannot be empty");
                }
            }
            ScraperValue::Literal { .. } | ScraperValue::Null | ScraperValue::CurrentTimestamp => {}
        }
    }

    fn validate_target(&mut self, index: usize, target: &str, markers: &HashMap<String, usize>) {
        if !markers.contains_key(target) {
            self.issue(index, format!("jump target '{}' does not name a marker", target));
        }
    }

    fn validate_selector(&mut self, index: usize, selector: &str) {
        if selector.trim().is_empty() {
            self.issue(index, "selector cannot be empty");
        }
    }

    fn validate_identifier(&mut self, index: usize, what: &str, name: &str) {
        if !is_identifier(name) {
            self.issue(index, format!("invalid {} name '{}'", what, name));
        }
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{SaveDataItem, SqliteConditionType};

    #[test]
    fn test_duplicate_and_missing_markers() {
        let instructions = vec![
            ScraperInstruction::Marker { name: "a".into() },
            ScraperInstruction::Marker { name: "a".into() },
            ScraperInstruction::Jump {
                marker: "b".into(),
                condition: None,
            },
        ];

        let issues = ProgramValidator::new().validate(&instructions).unwrap_err();
        assert_eq!(issues.len(), 2);
        assert!(issues[0].contains("duplicate marker 'a'"));
        assert!(issues[1].contains("'b'"));
    }

    #[test]
    fn test_condition_arity() {
        let between = Condition::new(
            ScraperValue::literal(5),
            SqliteConditionType::Between,
            vec![ScraperValue::literal(1)],
        );
        let instructions = vec![ScraperInstruction::Condition {
            condition: between,
            jump_to: None,
        }];

        let issues = ProgramValidator::new().validate(&instructions).unwrap_err();
        assert!(issues[0].contains("exactly two"));
    }

    #[test]
    fn test_identifiers_checked() {
        let instructions = vec![ScraperInstruction::SaveDataBatch {
            store: "items; DROP".into(),
            items: vec![SaveDataItem {
                column: "1col".into(),
                value: ScraperValue::Null,
            }],
        }];

        let issues = ProgramValidator::new().validate(&instructions).unwrap_err();
        assert_eq!(issues.len(), 2);
        assert!(is_identifier("_price2"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_valid_loop_program() {
        let instructions = vec![
            ScraperInstruction::Marker { name: "top".into() },
            ScraperInstruction::PageAction {
                page_index: 0,
                action: PageActionType::Wait {
                    duration_ms: Some(10),
                    selector: None,
                    timeout_ms: None,
                },
            },
            ScraperInstruction::Jump {
                marker: "top".into(),
                condition: None,
            },
        ];

        let markers = ProgramValidator::new().validate(&instructions).unwrap();
        assert_eq!(markers.get("top"), Some(&0));
    }
}
