use serde::{Deserialize, Serialize};

use webloom_providers::ProviderRegistry;

/// Name, description, and plan distilled from the user's raw idea at
/// project-creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub execution_plan: String,
}

const PLANNER_PROMPT: &str = r#"You are an AI product manager. A user will describe an app they want to build. Respond with ONLY a JSON object of the shape {"name": "...", "description": "...", "execution_plan": "..."}.

- name: short, catchy, easy to remember.
- description: one or two sentences on what the app does.
- execution_plan: a short numbered list of practical steps from design to launch.

No prose outside the JSON object."#;

/// Turn a raw app description into project info via the default provider.
/// Planner failures degrade to the raw description; project creation never
/// fails because the planner did.
pub async fn generate_app_info(providers: &ProviderRegistry, description: &str) -> AppInfo {
    let prompt = format!("{PLANNER_PROMPT}\n\nUser request: {description}");
    match providers.default_complete(&prompt).await {
        Ok(raw) => parse_app_info(&raw, description),
        Err(err) => {
            tracing::warn!(error = %err, "project info generation failed, using raw description");
            fallback_info(description)
        }
    }
}

fn parse_app_info(raw: &str, description: &str) -> AppInfo {
    let Some(start) = raw.find('{') else {
        return fallback_info(description);
    };
    let Some(end) = raw.rfind('}') else {
        return fallback_info(description);
    };
    if end < start {
        return fallback_info(description);
    }
    match serde_json::from_str::<AppInfo>(&raw[start..=end]) {
        Ok(info) if !info.name.trim().is_empty() => info,
        _ => fallback_info(description),
    }
}

fn fallback_info(description: &str) -> AppInfo {
    AppInfo {
        name: "App Project".to_string(),
        description: description.to_string(),
        execution_plan: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_embedded_in_prose() {
        let raw = r#"Here you go:
{"name": "HydroTracker", "description": "Track daily water intake.", "execution_plan": "1. Design UI"}
Hope that helps!"#;
        let info = parse_app_info(raw, "water app");
        assert_eq!(info.name, "HydroTracker");
        assert_eq!(info.execution_plan, "1. Design UI");
    }

    #[test]
    fn falls_back_to_raw_description_on_garbage() {
        let info = parse_app_info("Echo: no json here", "an app where people log hikes");
        assert_eq!(info.name, "App Project");
        assert_eq!(info.description, "an app where people log hikes");
    }

    #[test]
    fn empty_generated_name_falls_back_too() {
        let info = parse_app_info(r#"{"name": "  ", "description": "x"}"#, "original");
        assert_eq!(info.name, "App Project");
        assert_eq!(info.description, "original");
    }
}
