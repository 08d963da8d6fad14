//! 路由表：别名 -> 规范目标 (backend_id, tool_id)
//!
//! 解析顺序：精确别名 > 同义词组（声明顺序）> 规范化 token 集合 > 类别回退。
//! 同一层有多个候选时按 priority 降序、再按 (backend_id, tool_id) 字典序选择，
//! 因此解析结果与调用次序、哈希顺序无关。

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::ResolutionError;

/// 规范目标
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalTarget {
    pub backend_id: String,
    pub tool_id: String,
}

impl CanonicalTarget {
    pub fn new(backend_id: impl Into<String>, tool_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            tool_id: tool_id.into(),
        }
    }
}

impl fmt::Display for CanonicalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.backend_id, self.tool_id)
    }
}

/// 一条路由
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRoute {
    pub alias: String,
    pub target: CanonicalTarget,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl ToolRoute {
    pub fn new(alias: impl Into<String>, backend_id: impl Into<String>, tool_id: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            target: CanonicalTarget::new(backend_id, tool_id),
            priority: 0,
            category: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    fn rank(&self) -> (Reverse<i32>, &CanonicalTarget) {
        (Reverse(self.priority), &self.target)
    }
}

/// 磁盘/沙箱中的表示
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RouteTableFile {
    #[serde(default)]
    routes: Vec<ToolRoute>,
    #[serde(default)]
    synonyms: Vec<Vec<String>>,
}

/// 不可变路由表；替换时整体换新表
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    by_alias: BTreeMap<String, Vec<ToolRoute>>,
    synonyms: Vec<Vec<String>>,
}

impl RouteTable {
    pub fn new(routes: Vec<ToolRoute>, synonyms: Vec<Vec<String>>) -> Self {
        let mut by_alias: BTreeMap<String, Vec<ToolRoute>> = BTreeMap::new();
        for route in routes {
            by_alias.entry(route.alias.clone()).or_default().push(route);
        }
        for candidates in by_alias.values_mut() {
            candidates.sort_by(|a, b| a.rank().cmp(&b.rank()));
            candidates.dedup_by(|a, b| a.target == b.target);
        }
        Self { by_alias, synonyms }
    }

    /// 全部路由（按别名、再按优先级排序）
    pub fn routes(&self) -> impl Iterator<Item = &ToolRoute> {
        self.by_alias.values().flatten()
    }

    pub fn synonyms(&self) -> &[Vec<String>] {
        &self.synonyms
    }

    pub fn aliases(&self) -> Vec<String> {
        self.by_alias.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_alias.is_empty()
    }

    /// 解析别名；category 仅在前三层都失败时使用
    pub fn resolve(&self, alias: &str, category: Option<&str>) -> Result<CanonicalTarget, ResolutionError> {
        let alias = alias.trim();
        if alias.is_empty() {
            return Err(ResolutionError::EmptyAlias);
        }

        if let Some(route) = self.exact(alias) {
            return Ok(route.target.clone());
        }

        for group in &self.synonyms {
            if !group.iter().any(|member| member == alias) {
                continue;
            }
            if let Some(route) = group.iter().find_map(|member| self.exact(member)) {
                return Ok(route.target.clone());
            }
        }

        let key = token_key(alias);
        if !key.is_empty() {
            let best = self
                .by_alias
                .iter()
                .filter(|(candidate, _)| token_key(candidate) == key)
                .filter_map(|(_, routes)| routes.first())
                .min_by(|a, b| a.rank().cmp(&b.rank()));
            if let Some(route) = best {
                return Ok(route.target.clone());
            }
        }

        if let Some(category) = category {
            let best = self
                .routes()
                .filter(|r| r.category.as_deref() == Some(category))
                .min_by(|a, b| a.rank().cmp(&b.rank()));
            if let Some(route) = best {
                return Ok(route.target.clone());
            }
        }

        Err(ResolutionError::NoRoute {
            alias: alias.to_string(),
            category: category.map(str::to_string),
        })
    }

    /// 新表：alias 的所有旧路由被 route 取代
    pub fn with_route(&self, route: ToolRoute) -> Self {
        let mut routes: Vec<ToolRoute> = self.routes().filter(|r| r.alias != route.alias).cloned().collect();
        routes.push(route);
        Self::new(routes, self.synonyms.clone())
    }

    /// 新表：backend_id 的路由整体替换为 replacement
    pub fn replace_backend_routes(&self, backend_id: &str, replacement: Vec<ToolRoute>) -> Self {
        let mut routes: Vec<ToolRoute> = self
            .routes()
            .filter(|r| r.target.backend_id != backend_id)
            .cloned()
            .collect();
        routes.extend(replacement);
        Self::new(routes, self.synonyms.clone())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        let file = RouteTableFile {
            routes: self.routes().cloned().collect(),
            synonyms: self.synonyms.clone(),
        };
        toml::to_string(&file)
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        let file: RouteTableFile = toml::from_str(raw)?;
        Ok(Self::new(file.routes, file.synonyms))
    }

    fn exact(&self, alias: &str) -> Option<&ToolRoute> {
        self.by_alias.get(alias).and_then(|routes| routes.first())
    }
}

/// 规范化 token 集合：按 _ - . 空格 切分、小写、排序去重
pub fn token_key(alias: &str) -> Vec<String> {
    let mut tokens: Vec<String> = alias
        .split(|c: char| c == '_' || c == '-' || c == '.' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}
