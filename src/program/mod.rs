use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::{ScraperError, ScraperResult};

pub mod validator;

pub use validator::ProgramValidator;

/// A typed value resolved at run time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScraperValue {
    Literal {
        value: Value,
    },
    Null,
    /// Wall-clock time as Unix milliseconds
    CurrentTimestamp,
    #[serde(rename_all = "camelCase")]
    ExternalData {
        store: String,
        column: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        filters: Vec<DataFilter>,
        /// `Some(Value::Null)` is an explicitly declared null default
        #[serde(
            default,
            deserialize_with = "deserialize_some",
            skip_serializing_if = "Option::is_none"
        )]
        default: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ElementTextContent {
        selector: String,
        #[serde(default)]
        page_index: usize,
    },
    #[serde(rename_all = "camelCase")]
    ElementAttribute {
        selector: String,
        attribute: String,
        #[serde(default)]
        page_index: usize,
    },
}

impl ScraperValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal { value: value.into() }
    }

    pub fn text_of(selector: impl Into<String>) -> Self {
        Self::ElementTextContent {
            selector: selector.into(),
            page_index: 0,
        }
    }

    pub fn external(store: impl Into<String>, column: impl Into<String>) -> Self {
        Self::ExternalData {
            store: store.into(),
            column: column.into(),
            filters: Vec::new(),
            default: None,
        }
    }
}

/// Comparison operators, named after their SQLite counterparts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqliteConditionType {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Like,
    NotLike,
    ILike,
    NotILike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Between,
    NotBetween,
}

/// Number of right-hand operands an operator takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Nullary,
    Unary,
    AtLeastOne,
    Binary,
}

impl SqliteConditionType {
    pub fn arity(self) -> Arity {
        match self {
            Self::IsNull | Self::IsNotNull => Arity::Nullary,
            Self::In | Self::NotIn => Arity::AtLeastOne,
            Self::Between | Self::NotBetween => Arity::Binary,
            _ => Arity::Unary,
        }
    }

    /// Checks the operand count, ignoring operands of nullary operators
    pub fn check_arity(self, operands: usize) -> Result<(), String> {
        let ok = match self.arity() {
            Arity::Nullary => true,
            Arity::Unary => operands == 1,
            Arity::AtLeastOne => operands >= 1,
            Arity::Binary => operands == 2,
        };
        if ok {
            Ok(())
        } else {
            let expected = match self.arity() {
                Arity::Nullary => "no",
                Arity::Unary => "exactly one",
                Arity::AtLeastOne => "at least one",
                Arity::Binary => "exactly two",
            };
            Err(format!(
                "{:?} expects {} right-hand operand(s), got {}",
                self, expected, operands
            ))
        }
    }
}

/// Branch predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub left: ScraperValue,
    pub condition_type: SqliteConditionType,
    #[serde(default, deserialize_with = "one_or_many")]
    pub right: Vec<ScraperValue>,
}

impl Condition {
    pub fn new(left: ScraperValue, condition_type: SqliteConditionType, right: Vec<ScraperValue>) -> Self {
        Self {
            left,
            condition_type,
            right,
        }
    }
}

/// Row predicate applied by the data store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFilter {
    pub column: String,
    pub condition_type: SqliteConditionType,
    #[serde(default, deserialize_with = "one_or_many")]
    pub values: Vec<Value>,
}

impl DataFilter {
    pub fn new(column: impl Into<String>, condition_type: SqliteConditionType, values: Vec<Value>) -> Self {
        Self {
            column: column.into(),
            condition_type,
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PageActionType {
    #[serde(rename_all = "camelCase")]
    Navigate {
        url: ScraperValue,
        #[serde(default)]
        new_page: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Sleeps for `duration_ms`, or waits until `selector` appears
    #[serde(rename_all = "camelCase")]
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Click {
        selector: String,
        /// Falls back to smart click with this description when the selector is missing
        #[serde(default, skip_serializing_if = "Option::is_none")]
        smart_fallback: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    SmartClick {
        description: String,
    },
    #[serde(rename_all = "camelCase")]
    Type {
        selector: String,
        text: ScraperValue,
        #[serde(default)]
        clear: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    ScrollToBottom,
    ScrollToTop,
    ScrollToElement {
        selector: String,
    },
    Evaluate {
        script: String,
    },
}

impl PageActionType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "Navigate",
            Self::Wait { .. } => "Wait",
            Self::Click { .. } => "Click",
            Self::SmartClick { .. } => "SmartClick",
            Self::Type { .. } => "Type",
            Self::ScrollToBottom => "ScrollToBottom",
            Self::ScrollToTop => "ScrollToTop",
            Self::ScrollToElement { .. } => "ScrollToElement",
            Self::Evaluate { .. } => "Evaluate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SystemActionType {
    ShowNotification {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        message: ScraperValue,
    },
    ExecuteSystemCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveDataItem {
    pub column: String,
    pub value: ScraperValue,
}

/// One step of a scraper program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScraperInstruction {
    #[serde(rename_all = "camelCase")]
    PageAction {
        #[serde(default)]
        page_index: usize,
        action: PageActionType,
    },
    /// Jumps to `jump_to` when the predicate holds, otherwise falls through
    #[serde(rename_all = "camelCase")]
    Condition {
        condition: Condition,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jump_to: Option<String>,
    },
    SaveData {
        store: String,
        column: String,
        value: ScraperValue,
    },
    SaveDataBatch {
        store: String,
        items: Vec<SaveDataItem>,
    },
    DeleteData {
        store: String,
        #[serde(default)]
        filters: Vec<DataFilter>,
    },
    #[serde(rename_all = "camelCase")]
    DeleteCookies {
        #[serde(default)]
        page_index: usize,
    },
    Marker {
        name: String,
    },
    Jump {
        marker: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<Condition>,
    },
    SystemAction {
        action: SystemActionType,
    },
}

impl ScraperInstruction {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::PageAction { .. } => "PageAction",
            Self::Condition { .. } => "Condition",
            Self::SaveData { .. } => "SaveData",
            Self::SaveDataBatch { .. } => "SaveDataBatch",
            Self::DeleteData { .. } => "DeleteData",
            Self::DeleteCookies { .. } => "DeleteCookies",
            Self::Marker { .. } => "Marker",
            Self::Jump { .. } => "Jump",
            Self::SystemAction { .. } => "SystemAction",
        }
    }

    /// Short human-readable detail used in execution telemetry
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::PageAction { page_index, action } => {
                Some(format!("{} on page {}", action.name(), page_index))
            }
            Self::Condition { jump_to, .. } => jump_to.as_ref().map(|m| format!("jump to {}", m)),
            Self::SaveData { store, column, .. } => Some(format!("{}.{}", store, column)),
            Self::SaveDataBatch { store, items } => Some(format!("{} ({} columns)", store, items.len())),
            Self::DeleteData { store, .. } => Some(store.clone()),
            Self::DeleteCookies { page_index } => Some(format!("page {}", page_index)),
            Self::Marker { name } => Some(name.clone()),
            Self::Jump { marker, .. } => Some(marker.clone()),
            Self::SystemAction { action } => Some(match action {
                SystemActionType::ShowNotification { .. } => "ShowNotification".to_string(),
                SystemActionType::ExecuteSystemCommand { command, .. } => command.clone(),
            }),
        }
    }

    /// Every value operand referenced by this instruction
    pub fn values(&self) -> Vec<&ScraperValue> {
        fn condition_values(condition: &Condition) -> impl Iterator<Item = &ScraperValue> {
            std::iter::once(&condition.left).chain(condition.right.iter())
        }

        match self {
            Self::PageAction { action, .. } => match action {
                PageActionType::Navigate { url, .. } => vec![url],
                PageActionType::Type { text, .. } => vec![text],
                _ => Vec::new(),
            },
            Self::Condition { condition, .. } => condition_values(condition).collect(),
            Self::Jump { condition, .. } => condition.iter().flat_map(condition_values).collect(),
            Self::SaveData { value, .. } => vec![value],
            Self::SaveDataBatch { items, .. } => items.iter().map(|item| &item.value).collect(),
            Self::SystemAction {
                action: SystemActionType::ShowNotification { message, .. },
            } => vec![message],
            _ => Vec::new(),
        }
    }
}

/// A validated instruction program with its marker table resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ScraperInstruction>", into = "Vec<ScraperInstruction>")]
pub struct Program {
    instructions: Vec<ScraperInstruction>,
    markers: HashMap<String, usize>,
}

impl Program {
    pub fn new(instructions: Vec<ScraperInstruction>) -> ScraperResult<Self> {
        let markers = ProgramValidator::new()
            .validate(&instructions)
            .map_err(|issues| ScraperError::InvalidProgram { issues })?;

        Ok(Self {
            instructions,
            markers,
        })
    }

    pub fn from_json(json: &str) -> ScraperResult<Self> {
        let instructions: Vec<ScraperInstruction> =
            serde_json::from_str(json).map_err(|e| ScraperError::InvalidProgram {
                issues: vec![e.to_string()],
            })?;
        Self::new(instructions)
    }

    pub fn from_yaml(yaml: &str) -> ScraperResult<Self> {
        let instructions: Vec<ScraperInstruction> =
            serde_yaml::from_str(yaml).map_err(|e| ScraperError::InvalidProgram {
                issues: vec![e.to_string()],
            })?;
        Self::new(instructions)
    }

    pub fn to_json(&self) -> ScraperResult<String> {
        serde_json::to_string(&self.instructions).map_err(|e| ScraperError::internal(e.to_string()))
    }

    /// SHA-256 of the compact JSON form, hex encoded
    pub fn digest(&self) -> ScraperResult<String> {
        let json = self.to_json()?;
        let hash = Sha256::digest(json.as_bytes());
        Ok(hash.iter().map(|b| format!("{:02x}", b)).collect())
    }

    pub fn instructions(&self) -> &[ScraperInstruction] {
        &self.instructions
    }

    pub fn get(&self, index: usize) -> Option<&ScraperInstruction> {
        self.instructions.get(index)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn marker_index(&self, name: &str) -> Option<usize> {
        self.markers.get(name).copied()
    }
}

impl TryFrom<Vec<ScraperInstruction>> for Program {
    type Error = ScraperError;

    fn try_from(instructions: Vec<ScraperInstruction>) -> ScraperResult<Self> {
        Self::new(instructions)
    }
}

impl From<Program> for Vec<ScraperInstruction> {
    fn from(program: Program) -> Self {
        program.instructions
    }
}

fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match OneOrMany::<T>::deserialize(deserializer)? {
        OneOrMany::Many(values) => values,
        OneOrMany::One(value) => vec![value],
    })
}
