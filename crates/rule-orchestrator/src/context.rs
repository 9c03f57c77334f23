//! 执行上下文
//!
//! 以 `serde_json::Value` 存储嵌套数据，通过点号路径读写，并负责动作参数中
//! `${path}` 占位符的解析。

use std::fmt;

use serde_json::{Map, Value};

static TRUE_VALUE: Value = Value::Bool(true);
static FALSE_VALUE: Value = Value::Bool(false);

/// 点号分隔的字段路径
///
/// 支持数组下标（如 `items.0.name`）。字面路径 `true` / `false` 解析为布尔常量。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Self {
        let raw = path.trim().to_string();
        let segments = raw
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// 字面布尔常量
    pub fn constant(&self) -> Option<bool> {
        match self.raw.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// 在给定数据上解析路径，`None` 表示字段缺失
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        match self.constant() {
            Some(true) => return Some(&TRUE_VALUE),
            Some(false) => return Some(&FALSE_VALUE),
            None => {}
        }

        if self.segments.is_empty() {
            return None;
        }

        let mut current = root;
        for part in &self.segments {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(arr) => {
                    let index: usize = part.parse().ok()?;
                    arr.get(index)?
                }
                _ => return None,
            };
        }

        Some(current)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

/// 提取字符串中的全部占位符路径
pub fn placeholders(s: &str) -> impl Iterator<Item = &str> {
    let mut rest = s;
    std::iter::from_fn(move || {
        let start = rest.find("${")?;
        let after = &rest[start + 2..];
        let end = after.find('}')?;
        rest = &after[end + 1..];
        Some(after[..end].trim())
    })
    .filter(|name| !name.is_empty())
}

/// 整个字符串恰好是一个占位符时返回其路径
fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") || inner.contains('}') {
        return None;
    }
    Some(inner.trim())
}

/// 单次执行独占的可变上下文
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    data: Value,
}

impl ExecutionContext {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    /// 从 JSON 对象创建
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let data: Value = serde_json::from_str(json)?;
        Ok(Self { data })
    }

    /// 获取字段值（点号分隔路径）
    pub fn get(&self, path: &str) -> Option<&Value> {
        FieldPath::parse(path).resolve(&self.data)
    }

    pub fn get_path(&self, path: &FieldPath) -> Option<&Value> {
        path.resolve(&self.data)
    }

    /// 写入字段值，自动创建中间对象
    ///
    /// 路径上遇到非对象节点时以空对象替换。
    pub fn set(&mut self, path: &str, value: Value) {
        let path = FieldPath::parse(path);
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };

        let mut current = &mut self.data;
        for part in parents {
            let Some(map) = ensure_object(current) else {
                return;
            };
            current = map
                .entry(part.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        if let Some(map) = ensure_object(current) {
            map.insert(last.clone(), value);
        }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_inner(self) -> Value {
        self.data
    }

    /// 解析参数中的占位符
    ///
    /// 整个值为 `${path}` 时替换为上下文中的原始类型值；嵌入在字符串中的占位符
    /// 以文本形式插入。无法解析的占位符分别保留为 null 或原文，并记录警告。
    pub fn resolve_value(&self, value: &Value, warnings: &mut Vec<String>) -> Value {
        match value {
            Value::String(s) => self.resolve_str(s, warnings),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, warnings))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v, warnings)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_str(&self, s: &str, warnings: &mut Vec<String>) -> Value {
        if let Some(path) = whole_placeholder(s) {
            return match self.get(path) {
                Some(value) => value.clone(),
                None => {
                    warnings.push(format!("占位符未解析: ${{{}}}", path));
                    Value::Null
                }
            };
        }

        if !s.contains("${") {
            return Value::String(s.to_string());
        }

        let mut out = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };

            let path = after[..end].trim();
            match self.get(path) {
                Some(Value::String(v)) => out.push_str(v),
                Some(v) => out.push_str(&v.to_string()),
                None => {
                    warnings.push(format!("占位符未解析: ${{{}}}", path));
                    out.push_str(&rest[start..start + end + 3]);
                }
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);

        Value::String(out)
    }
}

impl From<Value> for ExecutionContext {
    fn from(data: Value) -> Self {
        Self::new(data)
    }
}

fn ensure_object(value: &mut Value) -> Option<&mut Map<String, Value>> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut()
}
