//! Template manager with hot reload (spec §4.6).
//!
//! Templates are `.txt`/`.md` files in a configured directory using
//! `{{name}}` / `{{name.sub}}` placeholders. Hot reload reuses the teacher's
//! own mtime-poll idiom (`config_watcher` in `main.rs`) rather than adding an
//! inotify dependency the teacher's stack has no other use for — polled on a
//! 250ms interval here to satisfy the spec's "reload within 250ms of a file
//! change" requirement. Brace balance is validated at load time so a bad
//! template fails fast instead of silently rendering garbage.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{ErrorKind, Result, RouterError};

#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub body: String,
    pub variables: Vec<String>,
}

struct Loaded {
    template: Template,
    mtime: Option<SystemTime>,
}

pub struct TemplateManager {
    dir: Option<PathBuf>,
    templates: RwLock<HashMap<String, Loaded>>,
}

impl TemplateManager {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir, templates: RwLock::new(HashMap::new()) }
    }

    /// Load (or reload) every `.txt`/`.md` file in the template directory.
    /// A no-op when no directory is configured.
    pub async fn load_all(&self) -> Result<()> {
        let Some(dir) = &self.dir else { return Ok(()) };
        let entries = std::fs::read_dir(dir)
            .map_err(|e| RouterError::new(ErrorKind::Config, format!("reading template dir: {e}")))?;

        let mut next = HashMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| RouterError::new(ErrorKind::Config, e.to_string()))?;
            let path = entry.path();
            if !is_template_file(&path) {
                continue;
            }
            let name = template_name(&path);
            let body = std::fs::read_to_string(&path)
                .map_err(|e| RouterError::new(ErrorKind::Config, format!("reading {}: {e}", path.display())))?;
            let mtime = entry.metadata().ok().and_then(|m| m.modified().ok());
            let template = parse_template(&name, body)?;
            next.insert(name, Loaded { template, mtime });
        }

        *self.templates.write().await = next;
        Ok(())
    }

    /// Re-read only the files whose mtime changed since the last load, and
    /// drop any previously loaded template whose file has since been
    /// deleted. Returns the names of templates that were added, changed, or
    /// removed. A parse failure on one file is logged and leaves that
    /// template's previous version in place, matching the teacher's "log and
    /// keep the running config" reload behavior.
    pub async fn reload_changed(&self) -> Vec<String> {
        let Some(dir) = self.dir.clone() else { return Vec::new() };
        let Ok(entries) = std::fs::read_dir(&dir) else { return Vec::new() };

        let mut reloaded = Vec::new();
        let mut on_disk = std::collections::HashSet::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_template_file(&path) {
                continue;
            }
            let name = template_name(&path);
            on_disk.insert(name.clone());
            let mtime = entry.metadata().ok().and_then(|m| m.modified().ok());

            let changed = {
                let templates = self.templates.read().await;
                templates.get(&name).map(|loaded| loaded.mtime != mtime).unwrap_or(true)
            };
            if !changed {
                continue;
            }

            match std::fs::read_to_string(&path).map_err(|e| e.to_string()).and_then(|body| {
                parse_template(&name, body).map_err(|e| e.to_string())
            }) {
                Ok(template) => {
                    self.templates.write().await.insert(name.clone(), Loaded { template, mtime });
                    reloaded.push(name);
                }
                Err(e) => {
                    tracing::warn!(template = %name, error = %e, "template reload failed — keeping previous version");
                }
            }
        }

        // Deletions: any previously loaded template whose backing file is
        // gone is dropped from the in-memory set atomically with the above
        // adds/changes (spec §4.6 "adds, changes, and deletions all update
        // the in-memory set atomically").
        let mut templates = self.templates.write().await;
        let removed: Vec<String> =
            templates.keys().filter(|name| !on_disk.contains(*name)).cloned().collect();
        for name in &removed {
            templates.remove(name);
        }
        drop(templates);
        reloaded.extend(removed);
        reloaded
    }

    pub async fn list(&self) -> Vec<String> {
        self.templates.read().await.keys().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<Template> {
        self.templates.read().await.get(name).map(|l| l.template.clone())
    }

    /// Render a template, substituting `{{name}}`/`{{name.sub}}` placeholders
    /// from `variables`. Non-string leaf values are pretty-printed JSON.
    pub async fn render(&self, name: &str, variables: &BTreeMap<String, Value>) -> Result<String> {
        let template = self
            .templates
            .read()
            .await
            .get(name)
            .map(|l| l.template.clone())
            .ok_or_else(|| RouterError::new(ErrorKind::TemplateSyntax, format!("unknown template `{name}`")))?;

        let missing: Vec<&str> = template
            .variables
            .iter()
            .filter(|v| resolve(variables, v).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(RouterError::new(
                ErrorKind::TemplateMissingVars,
                format!("template `{name}` missing variables: {}", missing.join(", ")),
            ));
        }

        let mut out = String::with_capacity(template.body.len());
        let mut rest = template.body.as_str();
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").expect("brace balance was validated at load time");
            let placeholder = after[..end].trim();
            let value = resolve(variables, placeholder).expect("checked above");
            out.push_str(&render_value(&value));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn is_template_file(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("txt") | Some("md"))
}

fn template_name(path: &Path) -> String {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("unnamed").to_string()
}

fn parse_template(name: &str, body: String) -> Result<Template> {
    validate_brace_balance(name, &body)?;
    let variables = extract_placeholders(&body);
    Ok(Template { name: name.to_string(), body, variables })
}

fn validate_brace_balance(name: &str, body: &str) -> Result<()> {
    let mut rest = body;
    loop {
        match rest.find("{{") {
            None => {
                if rest.contains("}}") {
                    return Err(RouterError::new(
                        ErrorKind::TemplateSyntax,
                        format!("template `{name}` has an unmatched `}}}}`"),
                    ));
                }
                return Ok(());
            }
            Some(start) => {
                let after = &rest[start + 2..];
                match after.find("}}") {
                    None => {
                        return Err(RouterError::new(
                            ErrorKind::TemplateSyntax,
                            format!("template `{name}` has an unmatched `{{{{`"),
                        ))
                    }
                    Some(end) => {
                        let inner = &after[..end];
                        if inner.contains("{{") {
                            return Err(RouterError::new(
                                ErrorKind::TemplateSyntax,
                                format!("template `{name}` has a nested `{{{{ {{{{ }}}} }}}}`"),
                            ));
                        }
                        if inner.trim().is_empty() {
                            return Err(RouterError::new(
                                ErrorKind::TemplateSyntax,
                                format!("template `{name}` has an empty `{{{{}}}}` placeholder"),
                            ));
                        }
                        rest = &after[end + 2..];
                    }
                }
            }
        }
    }
}

fn extract_placeholders(body: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else { break };
        let name = after[..end].trim().to_string();
        if !names.contains(&name) {
            names.push(name);
        }
        rest = &after[end + 2..];
    }
    names
}

fn resolve(variables: &BTreeMap<String, Value>, path: &str) -> Option<Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = variables.get(first)?.clone();
    for part in parts {
        current = current.get(part)?.clone();
    }
    Some(current)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn render_substitutes_simple_placeholder() {
        let manager = TemplateManager::new(None);
        manager
            .templates
            .write()
            .await
            .insert("t".into(), Loaded { template: parse_template("t", "Hello {{name}}!".into()).unwrap(), mtime: None });

        let rendered = manager.render("t", &vars(&[("name", json!("world"))])).await.unwrap();
        assert_eq!(rendered, "Hello world!");
    }

    #[tokio::test]
    async fn render_resolves_dotted_paths() {
        let manager = TemplateManager::new(None);
        manager.templates.write().await.insert(
            "t".into(),
            Loaded { template: parse_template("t", "Project: {{project.id}}".into()).unwrap(), mtime: None },
        );

        let rendered = manager
            .render("t", &vars(&[("project", json!({ "id": "abc123" }))]))
            .await
            .unwrap();
        assert_eq!(rendered, "Project: abc123");
    }

    #[tokio::test]
    async fn render_pretty_prints_non_string_values() {
        let manager = TemplateManager::new(None);
        manager.templates.write().await.insert(
            "t".into(),
            Loaded { template: parse_template("t", "Data: {{data}}".into()).unwrap(), mtime: None },
        );

        let rendered = manager.render("t", &vars(&[("data", json!({ "a": 1 }))])).await.unwrap();
        assert!(rendered.contains("\"a\""));
    }

    #[tokio::test]
    async fn render_fails_with_missing_vars_error_when_variable_absent() {
        let manager = TemplateManager::new(None);
        manager
            .templates
            .write()
            .await
            .insert("t".into(), Loaded { template: parse_template("t", "Hi {{name}}".into()).unwrap(), mtime: None });

        let err = manager.render("t", &BTreeMap::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TemplateMissingVars);
    }

    #[test]
    fn validate_brace_balance_rejects_unmatched_open() {
        let err = validate_brace_balance("t", "Hello {{name").unwrap_err();
        assert_eq!(err.kind, ErrorKind::TemplateSyntax);
    }

    #[test]
    fn validate_brace_balance_rejects_unmatched_close() {
        let err = validate_brace_balance("t", "Hello name}}").unwrap_err();
        assert_eq!(err.kind, ErrorKind::TemplateSyntax);
    }

    #[test]
    fn extract_placeholders_deduplicates_repeated_names() {
        let names = extract_placeholders("{{a}} and {{a}} and {{b}}");
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn validate_brace_balance_rejects_empty_placeholder() {
        let err = validate_brace_balance("t", "Hello {{}}").unwrap_err();
        assert_eq!(err.kind, ErrorKind::TemplateSyntax);
    }

    #[test]
    fn validate_brace_balance_rejects_nested_placeholder() {
        let err = validate_brace_balance("t", "Hello {{ {{inner}} }}").unwrap_err();
        assert_eq!(err.kind, ErrorKind::TemplateSyntax);
    }

    #[tokio::test]
    async fn reload_changed_removes_templates_whose_file_was_deleted() {
        let dir = std::env::temp_dir().join(format!("model-router-templates-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let file_path = dir.join("greeting.txt");
        std::fs::write(&file_path, "Hello {{name}}!").unwrap();

        let manager = TemplateManager::new(Some(dir.clone()));
        manager.load_all().await.unwrap();
        assert_eq!(manager.list().await, vec!["greeting".to_string()]);

        std::fs::remove_file(&file_path).unwrap();
        let changed = manager.reload_changed().await;

        assert!(manager.get("greeting").await.is_none());
        assert!(changed.contains(&"greeting".to_string()));
        std::fs::remove_dir_all(&dir).ok();
    }
}
