//! 从 LLM 输出中提取 JSON
//!
//! 支持 ```json 代码块、裸 JSON 数组 / 对象（取第一个开括号到最后一个对应闭括号）。

use serde::de::DeserializeOwned;

/// 提取 JSON 片段；找不到返回 None
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let body = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        return Some(body.trim());
    }

    let open = trimmed.find(['{', '['])?;
    let close_char = if trimmed[open..].starts_with('{') { '}' } else { ']' };
    let close = trimmed.rfind(close_char)?;
    if close < open {
        return None;
    }
    Some(&trimmed[open..=close])
}

/// 提取并反序列化
pub fn parse_json<T: DeserializeOwned>(output: &str) -> Result<T, String> {
    let json = extract_json(output).ok_or_else(|| format!("no JSON found in model output: {}", preview(output)))?;
    serde_json::from_str(json).map_err(|e| format!("{}: {}", e, preview(json)))
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_fenced_block() {
        let out = "Here you go:\n```json\n[\"a\", \"b\"]\n```\nthanks";
        assert_eq!(extract_json(out), Some("[\"a\", \"b\"]"));
    }

    #[test]
    fn test_bare_object_and_array() {
        assert_eq!(extract_json("sure {\"x\": {\"y\": 1}} ok"), Some("{\"x\": {\"y\": 1}}"));
        assert_eq!(extract_json("steps: [1, [2]]"), Some("[1, [2]]"));
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn test_parse_error_mentions_input() {
        let err = parse_json::<Value>("{ broken").unwrap_err();
        assert!(err.contains("no JSON") || err.contains("broken"));
    }
}
