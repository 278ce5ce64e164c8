use serde_json::Value;

/// Fields tried, in order, for tools without a dedicated label.
const COMMON_FIELDS: &[&str] = &[
    "file_path",
    "path",
    "pattern",
    "command",
    "url",
    "query",
    "description",
    "prompt",
    "subject",
    "name",
];

fn field<'a>(input: &'a Value, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| {
        input
            .get(*name)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
    })
}

/// Human-readable activity label for a tool invocation, e.g. `Reading src/main.rs`.
pub fn tool_activity_label(name: &str, input: &Value) -> String {
    match name {
        "Read" => format!(
            "Reading {}",
            field(input, &["file_path", "path"]).unwrap_or("a file")
        ),
        "Write" => format!(
            "Writing {}",
            field(input, &["file_path", "path"]).unwrap_or("a file")
        ),
        "Edit" | "MultiEdit" => format!(
            "Editing {}",
            field(input, &["file_path", "path"]).unwrap_or("a file")
        ),
        "NotebookEdit" => format!(
            "Editing {}",
            field(input, &["notebook_path"]).unwrap_or("a notebook")
        ),
        // Prefer the human-readable description over the raw command
        "Bash" => format!(
            "Running {}",
            field(input, &["description", "command"]).unwrap_or("a command")
        ),
        "Glob" => format!("Finding {}", field(input, &["pattern"]).unwrap_or("files")),
        "Grep" => format!("Searching for {}", field(input, &["pattern"]).unwrap_or("text")),
        "WebSearch" => format!(
            "Searching the web for {}",
            field(input, &["query"]).unwrap_or("results")
        ),
        "WebFetch" => format!("Fetching {}", field(input, &["url"]).unwrap_or("a page")),
        "Task" => format!(
            "Delegating {}",
            field(input, &["description", "prompt"]).unwrap_or("a task")
        ),
        "TodoWrite" => input
            .get("todos")
            .and_then(Value::as_array)
            .map(|todos| format!("Updating {} todo(s)", todos.len()))
            .unwrap_or_else(|| "Updating todos".to_string()),
        _ => match field(input, COMMON_FIELDS) {
            Some(value) => format!("Using {}: {}", name, value),
            None => format!("Using {}", name),
        },
    }
}
