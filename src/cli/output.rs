//! Output helpers for consistent CLI formatting

use console::style;

/// Display a section header
pub fn section(title: &str) {
    println!("{}", style(title).cyan().bold());
}

/// Display a success step with detail
pub fn step_ok_detail(message: &str, detail: &str) {
    println!("  {} {} ({})", style("[OK]").green(), message, style(detail).dim());
}

/// Display a warning step with a hint
pub fn step_warn_hint(message: &str, hint: &str) {
    println!("  {} {}", style("[WARN]").yellow(), message);
    println!("       {}", style(hint).dim());
}

/// Display an aligned key/value line
pub fn field(key: &str, value: impl std::fmt::Display) {
    println!("  {:<14} {}", style(key).bold(), value);
}

/// "hit" in green, "miss" in yellow
pub fn hit_or_miss(hit: bool) -> console::StyledObject<&'static str> {
    if hit {
        style("hit").green()
    } else {
        style("miss").yellow()
    }
}
