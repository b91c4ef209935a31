//! Structural patches: deterministic edits to the existing site sources for
//! "change the site itself" requests.
//!
//! Planning is pure (read, transform in memory). Nothing touches disk until
//! [`PatchPlan::apply`], and an applied plan can be reverted if the
//! submission turns out to have been cancelled.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("UI_PATCH_NO_EFFECT")]
    NoEffect,
    #[error("UI_PATCH_IO:{0}")]
    Io(#[from] std::io::Error),
}

fn ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("valid regex")
}

// Site controls only: the request box and its generate button.
static BUTTON_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    ci(r"\b(generate|submit|send)\s+button\b.*\b(too small|too short|bigger|taller|height|width|size)\b|按钮.*(太小|太矮|高度|宽度)")
});
static INPUT_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    ci(r"\bthe\s+(request\s+)?(input(\s+box|\s+field)?|text\s*box|textarea)\b.*\b(too short|too small|taller|multi-?line|five lines|5 lines|rows|height)\b|输入框.*(太矮|太高|多行|五行|高度)")
});
static MULTILINE_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    ci(r"\bthe\s+(request\s+)?(input(\s+box|\s+field)?|text\s*box|textarea)\b.*\b(multi-?line|five lines|5 lines|rows)\b|输入框.*(多行|五行)")
});
static REMOVE_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    ci(r"\b(remove|delete|hide)\b.*\b(unknown module|red box|module card)s?\b|(删除|删掉|去掉).*(未知模块|红色框|重复模块|模块卡片)")
});

static UNKNOWN_CARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"card\.textContent = `(Unknown module|未知模块): \$\{type\}`;\n\s*return card;")
        .expect("valid regex")
});
static UNGUARDED_APPEND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"runtimeRoot\.appendChild\(createFeatureCard\(feature\)\);").expect("valid regex")
});
static COMPOSER_BUTTON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(\.composer button\s*\{[^}]*?)height:\s*[^;]+;([^}]*\})").expect("valid regex")
});
static REQUEST_ROWS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<textarea id="requestInput"[^>]*rows="\d+""#).expect("valid regex")
});

const APP_JS: &str = "public/app.js";
const STYLES_CSS: &str = "public/styles.css";
const INDEX_HTML: &str = "public/index.html";

/// Whether a request asks to modify the existing site rather than add a
/// feature module.
pub fn is_patch_request(request: &str) -> bool {
    let text = request.trim();
    !text.is_empty()
        && [&BUTTON_INTENT, &INPUT_INTENT, &REMOVE_INTENT]
            .iter()
            .any(|re| re.is_match(text))
}

#[derive(Debug, Clone)]
struct FileEdit {
    /// Site-relative path, as recorded on the artifact.
    rel: String,
    original: String,
    patched: String,
}

/// The edits a request resolves to.
#[derive(Debug, Clone)]
pub struct PatchPlan {
    root: PathBuf,
    edits: Vec<FileEdit>,
}

impl PatchPlan {
    pub fn changed_files(&self) -> Vec<String> {
        self.edits.iter().map(|e| e.rel.clone()).collect()
    }

    pub async fn apply(&self) -> Result<(), PatchError> {
        for edit in &self.edits {
            tokio::fs::write(self.root.join(&edit.rel), &edit.patched).await?;
        }
        Ok(())
    }

    /// Put back the contents seen at planning time.
    pub async fn revert(&self) -> Result<(), PatchError> {
        for edit in &self.edits {
            tokio::fs::write(self.root.join(&edit.rel), &edit.original).await?;
        }
        Ok(())
    }
}

async fn read_if_exists(path: &Path) -> Result<Option<String>, PatchError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Resolve `request` to concrete edits under `site_dir`. Fails with
/// [`PatchError::NoEffect`] when every matching transformation is already
/// applied or its target file is missing.
pub async fn plan(site_dir: &Path, request: &str) -> Result<PatchPlan, PatchError> {
    let mut edits = Vec::new();

    if REMOVE_INTENT.is_match(request) {
        consider(site_dir, APP_JS, drop_unknown_module_card, &mut edits).await?;
    }
    if BUTTON_INTENT.is_match(request) || INPUT_INTENT.is_match(request) {
        consider(site_dir, STYLES_CSS, stretch_composer_button, &mut edits).await?;
    }
    if MULTILINE_INTENT.is_match(request) {
        consider(site_dir, INDEX_HTML, five_row_request_input, &mut edits).await?;
    }

    if edits.is_empty() {
        return Err(PatchError::NoEffect);
    }
    Ok(PatchPlan {
        root: site_dir.to_path_buf(),
        edits,
    })
}

async fn consider(
    site_dir: &Path,
    rel: &str,
    transform: fn(&str) -> String,
    edits: &mut Vec<FileEdit>,
) -> Result<(), PatchError> {
    if let Some(original) = read_if_exists(&site_dir.join(rel)).await? {
        let patched = transform(&original);
        if patched != original {
            edits.push(FileEdit {
                rel: rel.to_string(),
                original,
                patched,
            });
        }
    }
    Ok(())
}

fn drop_unknown_module_card(app_js: &str) -> String {
    let out = UNKNOWN_CARD.replace(app_js, "return null;");
    UNGUARDED_APPEND
        .replace(
            &out,
            "const card = createFeatureCard(feature);\n    if (card) runtimeRoot.appendChild(card);",
        )
        .into_owned()
}

fn stretch_composer_button(css: &str) -> String {
    // Already stretched: leave it alone so the edit stays idempotent.
    let stretched = COMPOSER_BUTTON
        .find(css)
        .is_some_and(|block| block.as_str().contains("height: auto;"));
    if stretched {
        return css.to_string();
    }
    COMPOSER_BUTTON
        .replace(css, "${1}height: auto;\n  min-height: 8.5rem;\n  align-self: stretch;${2}")
        .into_owned()
}

fn five_row_request_input(html: &str) -> String {
    REQUEST_ROWS
        .replace(html, |caps: &regex::Captures| {
            let tag = &caps[0];
            match tag.rfind("rows=\"") {
                Some(at) => format!("{}rows=\"5\"", &tag[..at]),
                None => tag.to_string(),
            }
        })
        .into_owned()
}
