pub const PLAN_SCHEMA: &str = r#"{
  "analysis": "string",
  "steps": [{"id": int, "action": "string", "details": "string"}],
  "estimated_complexity": "string",
  "safety_flag": boolean
}"#;

pub const PLANNER_SYSTEM_PROMPT: &str = "You are a software planner. Break the user's request into \
concrete execution steps for a single Python program. Respond with one flat JSON object matching \
the schema below. Do NOT wrap it in another key such as \"execution_plan\". Every step id must be \
unique.";

pub const GENERATOR_SYSTEM_PROMPT: &str = "You are an expert Python engineer. Implement the plan \
you are given exactly. Return ONLY the complete, runnable Python program: no Markdown fences and \
no explanation. Save any plots as PNG files in the current directory instead of calling \
plt.show(). Define every variable you use and avoid placeholder values. Keep network calls inside \
functions whose inputs are defined. When network access is allowed, check HTTP responses for \
missing fields and print the payload and exit cleanly if they are absent.";

pub fn planner_system_prompt() -> String {
    format!("{}\n\nJSON schema:\n{}", PLANNER_SYSTEM_PROMPT, PLAN_SCHEMA)
}

/// Second system message for the generator; the program runs with or without network.
pub fn network_notice(allow_network: bool) -> String {
    if allow_network {
        "Network access allowed: true. Outbound HTTP requests will work.".to_string()
    } else {
        "Network access allowed: false. Do not make any outbound HTTP requests or call external \
         APIs; use mocked or local data instead."
            .to_string()
    }
}
