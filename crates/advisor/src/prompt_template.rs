use include_dir::{include_dir, Dir};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tera::{Context, Error as TeraError, Tera};

/// Prompts compiled into the binary, looked up by file name
static PROMPTS: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/src/prompts");

fn embedded_prompt(name: &str) -> Option<&'static str> {
    PROMPTS.get_file(name).and_then(|file| file.contents_utf8())
}

pub fn load_prompt<T: Serialize>(template: &str, context_data: &T) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline_template", template)?;
    let context = Context::from_serialize(context_data)?;
    let rendered = tera.render("inline_template", &context)?;
    Ok(rendered)
}

/// Render a prompt template by name.
///
/// Embedded prompts win; anything else is read from disk, so deployments can
/// point at their own template files.
pub fn load_prompt_file<T: Serialize>(
    template_file: impl Into<PathBuf>,
    context_data: &T,
) -> Result<String, TeraError> {
    let template_path = template_file.into();
    if let Some(template) = template_path.to_str().and_then(embedded_prompt) {
        return load_prompt(template, context_data);
    }

    let template_content = fs::read_to_string(&template_path)
        .map_err(|e| TeraError::chain("Failed to read template file", e))?;
    load_prompt(&template_content, context_data)
}
