//! 模板展开模块
//!
//! 把用户配置的任务模板展开成按账号排列的动作列表。展开是纯函数，不保存状态。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::farm::AccountId;
use crate::farm::driver::Action;

/// 账号占位符
const ACCOUNT_PLACEHOLDER: &str = "{account}";

/// 任务模板定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// 每个账号依次执行的动作
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// 单个账号的执行计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountPlan {
    pub account_id: AccountId,
    pub actions: Vec<Action>,
}

/// 模板错误
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("模板不存在: {0}")]
    NotFound(String),

    #[error("模板无效: {0}")]
    Invalid(String),
}

/// 模板展开器
pub trait TemplateExpander: Send + Sync {
    /// 按账号顺序展开模板
    fn expand(&self, template: &str, accounts: &[AccountId])
    -> Result<Vec<AccountPlan>, TemplateError>;
}

/// 基于配置文件的模板集合
#[derive(Debug, Default)]
pub struct ConfigTemplates {
    templates: HashMap<String, TemplateDefinition>,
}

impl ConfigTemplates {
    pub fn new(definitions: impl IntoIterator<Item = TemplateDefinition>) -> Self {
        Self {
            templates: definitions
                .into_iter()
                .map(|definition| (definition.name.clone(), definition))
                .collect(),
        }
    }

    /// 已加载的模板名称
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }
}

impl TemplateExpander for ConfigTemplates {
    fn expand(
        &self,
        template: &str,
        accounts: &[AccountId],
    ) -> Result<Vec<AccountPlan>, TemplateError> {
        let definition = self
            .templates
            .get(template)
            .ok_or_else(|| TemplateError::NotFound(template.to_string()))?;

        if definition.actions.is_empty() {
            return Err(TemplateError::Invalid(format!("模板 {} 没有任何动作", template)));
        }

        if let Some(action) = definition.actions.iter().find(|a| a.kind.trim().is_empty()) {
            return Err(TemplateError::Invalid(format!(
                "模板 {} 含有未指定类型的动作: {}",
                template, action.params
            )));
        }

        Ok(accounts
            .iter()
            .map(|account| AccountPlan {
                account_id: account.clone(),
                actions: definition
                    .actions
                    .iter()
                    .map(|action| Action {
                        kind: action.kind.clone(),
                        params: substitute(&action.params, account),
                    })
                    .collect(),
            })
            .collect())
    }
}

/// 递归替换字符串参数中的账号占位符
fn substitute(value: &serde_json::Value, account: &str) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::String(s) if s.contains(ACCOUNT_PLACEHOLDER) => {
            Value::String(s.replace(ACCOUNT_PLACEHOLDER, account))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, account)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, account)))
                .collect(),
        ),
        other => other.clone(),
    }
}
