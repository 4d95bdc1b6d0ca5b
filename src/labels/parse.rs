//! Mapping free-form vision output onto the label taxonomy.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Normalized label values from one parsed response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelSet {
    pub categories: Vec<String>,
    pub types: Vec<String>,
    pub colors: Vec<String>,
    pub styles: Vec<String>,
    pub materials: Vec<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LabelParse {
    Parsed { labels: LabelSet, digest: String },
    Unparseable { digest: String },
}

impl LabelParse {
    pub fn digest(&self) -> &str {
        match self {
            LabelParse::Parsed { digest, .. } | LabelParse::Unparseable { digest } => digest,
        }
    }
}

/// SHA-256 of the raw response text.
pub fn response_digest(raw: &str) -> String {
    format!("{:x}", Sha256::digest(raw.as_bytes()))
}

/// Slice out the outermost `{...}` block, skipping any prose or markdown
/// fences around it.
fn extract_json(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&content[start..=end])
}

/// `"Sage Green"` → `"sage_green"`, `"T-shirt"` → `"t_shirt"`.
pub fn normalize_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            out.push(ch);
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Strings from a value that may be a string, a list of strings, or a list
/// of objects carrying a `name`/`color` field.
fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => obj
                    .get("name")
                    .or_else(|| obj.get("color"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn push_normalized(target: &mut Vec<String>, values: Vec<String>) {
    for value in values {
        let label = normalize_label(&value);
        if !label.is_empty() && !target.contains(&label) {
            target.push(label);
        }
    }
}

fn as_confidence(value: Option<&Value>) -> Option<f32> {
    value.and_then(Value::as_f64).map(|c| c as f32)
}

/// Parse a raw vision response. Never fails: anything that does not carry
/// recognizable taxonomy fields is `Unparseable`.
pub fn parse_response(raw: &str) -> LabelParse {
    let digest = response_digest(raw);
    let unparseable = || LabelParse::Unparseable {
        digest: digest.clone(),
    };

    let Some(json) = extract_json(raw) else {
        return unparseable();
    };
    let Ok(Value::Object(root)) = serde_json::from_str::<Value>(json) else {
        return unparseable();
    };

    let items = root
        .get("detected_fashion_items")
        .or_else(|| root.get("fashion_items"));
    let style_analysis = root.get("comprehensive_style_analysis");
    let color_analysis = root.get("color_analysis");
    let top_confidence = as_confidence(root.get("confidence_score"))
        .or_else(|| as_confidence(root.get("confidence")));

    if items.is_none() && style_analysis.is_none() && color_analysis.is_none() {
        return unparseable();
    }

    let mut labels = LabelSet::default();
    let mut item_confidences = Vec::new();

    for item in items.and_then(Value::as_array).into_iter().flatten() {
        push_normalized(&mut labels.categories, strings(item.get("category")));
        push_normalized(&mut labels.types, strings(item.get("type")));
        push_normalized(
            &mut labels.colors,
            strings(item.get("colors").or_else(|| item.get("color"))),
        );
        push_normalized(
            &mut labels.materials,
            strings(item.get("material").or_else(|| item.get("materials"))),
        );
        push_normalized(&mut labels.styles, strings(item.get("style")));
        if let Some(c) = as_confidence(item.get("confidence")) {
            item_confidences.push(c);
        }
    }

    if let Some(style) = style_analysis {
        push_normalized(&mut labels.styles, strings(style.get("style_category")));
    }
    if let Some(colors) = color_analysis {
        push_normalized(&mut labels.colors, strings(colors.get("dominant_colors")));
    }

    let confidence = top_confidence.unwrap_or_else(|| {
        if item_confidences.is_empty() {
            0.0
        } else {
            item_confidences.iter().sum::<f32>() / item_confidences.len() as f32
        }
    });
    labels.confidence = if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    LabelParse::Parsed { labels, digest }
}
