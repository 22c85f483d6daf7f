pub const TITLE_PREFIX: &str = "%% title:";

/// Keeps only `[A-Za-z0-9_]`, the characters Mermaid accepts in a bare id.
pub fn sanitize_id_stem(input: &str) -> String {
    input
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .collect()
}

/// Truncates on a char boundary; labels are often not ASCII.
pub fn truncate_chars(input: &str, max: usize) -> &str {
    match input.char_indices().nth(max) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

/// Strips a leading `%% title:` line from a stored chart.
pub fn split_title(source: &str) -> (Option<String>, String) {
    let mut title = None;
    let mut definition_lines = Vec::new();

    for line in source.lines() {
        let trimmed = line.trim();
        if title.is_none() && definition_lines.iter().all(|l: &&str| l.trim().is_empty()) {
            if let Some(rest) = trimmed.strip_prefix(TITLE_PREFIX) {
                title = Some(rest.trim().to_string());
                continue;
            }
        }
        definition_lines.push(line);
    }

    if title.is_none() {
        return (None, source.to_string());
    }

    let mut definition = definition_lines.join("\n");
    if source.ends_with('\n') && !definition.is_empty() {
        definition.push('\n');
    }
    (title, definition)
}

pub fn merge_title(title: &str, definition: &str) -> String {
    let title = title.trim();
    if title.is_empty() {
        return definition.to_string();
    }
    let mut merged = format!("{TITLE_PREFIX} {title}\n");
    merged.push_str(definition);
    if !merged.ends_with('\n') {
        merged.push('\n');
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_line_round_trips() {
        let stored = merge_title("Onboarding", "graph TD\n    A\n");
        assert_eq!(stored, "%% title: Onboarding\ngraph TD\n    A\n");
        let (title, definition) = split_title(&stored);
        assert_eq!(title.as_deref(), Some("Onboarding"));
        assert_eq!(definition, "graph TD\n    A\n");
    }

    #[test]
    fn truncation_respects_multibyte_labels() {
        assert_eq!(truncate_chars("開始終了", 2), "開始");
        assert_eq!(truncate_chars("ab", 5), "ab");
        assert_eq!(sanitize_id_stem("Intro 段階-1"), "Intro1");
    }
}
