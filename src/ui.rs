use colored::{ColoredString, Colorize};
use provision::{Action, AttributeChange};
use remote::TargetStepError;
use provision::types::json_text;
use similar::{ChangeTag, TextDiff};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(console::measure_text_width(title)).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Print a failed target with the category of its failure and advice
pub fn target_failure(error: &TargetStepError) {
    println!("  {} {}", "✗".red(), truncate(&error.to_string(), 120));
    dim(&failure_hint(error));
}

/// `<category>: <advice>` line shown under a failed target
pub fn failure_hint(error: &TargetStepError) -> String {
    let category = error.source.category();
    format!("{}: {}", category.description(), category.advice())
}

// ============================================================================
// Plan Rendering
// ============================================================================

/// Colored symbol for a planned action
pub fn action_symbol(action: Action) -> ColoredString {
    match action {
        Action::Create => action.symbol().green(),
        Action::Update => action.symbol().yellow(),
        Action::Delete => action.symbol().red(),
        Action::NoOp => action.symbol().dimmed(),
    }
}

/// Print one attribute change under a planned resource
///
/// Multi-line values (scripts, user data) are shown as a line diff.
pub fn attribute_change(change: &AttributeChange) {
    let before = change.before.as_ref().map(json_text);
    let Some(after) = change.after.as_ref().map(json_text) else {
        println!(
            "      {} = {}",
            change.key,
            "(known after apply)".dimmed()
        );
        return;
    };

    match before {
        Some(before) if before.contains('\n') || after.contains('\n') => {
            println!("      {}:", change.key);
            for (tag, line) in diff_lines(&before, &after) {
                match tag {
                    ChangeTag::Delete => println!("        {}", format!("- {line}").red()),
                    ChangeTag::Insert => println!("        {}", format!("+ {line}").green()),
                    ChangeTag::Equal => {}
                }
            }
        }
        Some(before) => println!(
            "      {} = {} → {}",
            change.key,
            before.red(),
            after.green()
        ),
        None => println!("      {} = {}", change.key, after.green()),
    }
}

/// Changed lines between two texts, without trailing newlines
pub fn diff_lines(before: &str, after: &str) -> Vec<(ChangeTag, String)> {
    TextDiff::from_lines(before, after)
        .iter_all_changes()
        .filter(|change| change.tag() != ChangeTag::Equal)
        .map(|change| {
            (
                change.tag(),
                change.value().trim_end_matches('\n').to_string(),
            )
        })
        .collect()
}

/// Truncate text for a single display line, keeping the start
pub fn truncate(text: &str, max_len: usize) -> String {
    let first = text.lines().next().unwrap_or_default();
    if first.chars().count() <= max_len && first.len() == text.len() {
        text.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let kept: String = first.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

// ============================================================================
// Tests
// ============================================================================
