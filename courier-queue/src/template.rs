//! `{{placeholder}}` substitution for producers.

use crate::job::TemplateData;

/// Replaces every `{{key}}` whose key exactly matches (case-sensitive, no
/// trimming) an entry in `data`. Unknown placeholders are left untouched and
/// substituted values are never scanned again.
#[must_use]
pub fn render(template: &str, data: &TemplateData) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = &after_open[..end];
        match data.get(key) {
            Some(value) => out.push_str(value),
            None => {
                out.push_str("{{");
                out.push_str(key);
                out.push_str("}}");
            }
        }

        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn data(pairs: &[(&str, &str)]) -> TemplateData {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn replaces_all_occurrences() {
        let data = data(&[("course", "First Aid")]);
        assert_eq!(
            render("{{course}} booked. See you at {{course}}!", &data),
            "First Aid booked. See you at First Aid!"
        );
    }

    #[test]
    fn matching_is_exact() {
        let data = data(&[("name", "Jane")]);
        assert_eq!(
            render("{{name}} {{Name}} {{ name }}", &data),
            "Jane {{Name}} {{ name }}"
        );
    }

    #[test]
    fn values_are_not_rescanned() {
        let data = data(&[("a", "{{b}}"), ("b", "x")]);
        assert_eq!(render("{{a}}", &data), "{{b}}");
    }

    #[test]
    fn unterminated_placeholder() {
        let data = data(&[("name", "Jane")]);
        assert_eq!(render("Hi {{name", &data), "Hi {{name");
        assert_eq!(render("{{name}} and {{", &data), "Jane and {{");
    }

    #[test]
    fn non_ascii_text() {
        let data = data(&[("city", "Zürich")]);
        assert_eq!(render("Grüße aus {{city}} ✓", &data), "Grüße aus Zürich ✓");
    }
}
