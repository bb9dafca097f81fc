//! `{placeholder}` substitution shared by the source/component URL
//! templates and the
//! component artifact filename template (`{name}`/`{version}`).
//! Placeholders are substituted literally; anything not supplied is an
//! unresolvable template.

use ldfd_types::error::LdfdError;

/// Substitutes every `{name}` placeholder in `template` with the matching
/// entry in `vars`. Any placeholder absent from `vars` fails with
/// `TemplateUnresolvable` naming it; an unterminated `{` does the same.
pub fn resolve(template: &str, vars: &[(&str, &str)]) -> Result<String, LdfdError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return Err(LdfdError::TemplateUnresolvable(format!("unterminated placeholder in {template:?}")));
        };
        let name = &after[..end];
        match vars.iter().find(|(k, _)| *k == name) {
            Some((_, v)) => out.push_str(v),
            None => return Err(LdfdError::TemplateUnresolvable(name.to_string())),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Convenience for the source/component URL templates: `{base_url}` and
/// `{version}`.
pub fn resolve_url(template: &str, base_url: &str, version: &str) -> Result<String, LdfdError> {
    resolve(template, &[("base_url", base_url), ("version", version)])
}

/// Convenience for `Component::artifact_template`: `{name}` and `{version}`.
pub fn resolve_filename(template: &str, name: &str, version: &str) -> Result<String, LdfdError> {
    resolve(template, &[("name", name), ("version", version)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_both_placeholders() {
        let url = resolve_url("{base_url}/linux-{version}.tar.xz", "https://example.org", "6.12.3").unwrap();
        assert_eq!(url, "https://example.org/linux-6.12.3.tar.xz");
    }

    #[test]
    fn repeated_placeholder_substitutes_every_occurrence() {
        let url = resolve_url("{base_url}/{version}/{version}.tar.gz", "https://x", "1.0").unwrap();
        assert_eq!(url, "https://x/1.0/1.0.tar.gz");
    }

    #[test]
    fn unknown_placeholder_is_unresolvable() {
        let err = resolve_url("{owner}/{version}.tar.gz", "https://x", "1.0").unwrap_err();
        assert!(matches!(err, LdfdError::TemplateUnresolvable(name) if name == "owner"));
    }

    #[test]
    fn unterminated_brace_is_unresolvable() {
        assert!(resolve_url("{base_url}/{version", "https://x", "1.0").is_err());
    }

    #[test]
    fn template_with_no_placeholders_passes_through() {
        assert_eq!(resolve_url("https://static.example.org/file.tar.gz", "https://x", "1.0").unwrap(), "https://static.example.org/file.tar.gz");
    }

    #[test]
    fn filename_template_substitutes_name_and_version() {
        assert_eq!(resolve_filename("{name}-{version}.tar.xz", "linux", "6.12.3").unwrap(), "linux-6.12.3.tar.xz");
    }
}
