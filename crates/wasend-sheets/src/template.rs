//! `{{field}}` placeholder substitution.

use std::collections::HashMap;

/// Render a message template against one recipient's fields.
///
/// Placeholder names are matched case-insensitively after trimming.
/// Unknown placeholders are left untouched.
pub fn render_template(template: &str, fields: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            break;
        };

        out.push_str(&rest[..start]);
        let key = after_open[..end].trim().to_lowercase();
        match fields.get(&key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}
