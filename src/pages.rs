use std::fmt::Write;

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use tracing::error;
use upon::{Engine, Template, Value, fmt};

use crate::error::DownloadError;

const INDEX_TEMPLATE: &str = include_str!("../templates/index.html");

/// The submission form, compiled once at startup.
pub struct Pages {
    engine: Engine<'static>,
    index: Template<'static>,
}

impl Pages {
    pub fn new() -> Result<Self, DownloadError> {
        let mut engine = Engine::new();
        engine.set_default_formatter(&escape_html);
        let index = engine.compile(INDEX_TEMPLATE)?;
        Ok(Self { engine, index })
    }

    /// Renders the form, optionally with an error message and the URL the user
    /// submitted.
    pub fn form(&self, status: StatusCode, error_message: Option<&str>, url: Option<&str>) -> Response {
        let rendered = self
            .index
            .render(
                &self.engine,
                upon::value! {
                    error: error_message.unwrap_or_default(),
                    url: url.unwrap_or_default(),
                },
            )
            .to_string();

        match rendered {
            Ok(html) => (status, Html(html)).into_response(),
            Err(render_error) => {
                error!("Could not render the form: {render_error}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
        }
    }
}

/// Default formatter for every `{{ }}` expression. Both the error text and the
/// echoed URL come from the user.
fn escape_html(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    let Value::String(text) = value else {
        return fmt::default(f, value);
    };

    for character in text.chars() {
        match character {
            '&' => f.write_str("&amp;")?,
            '<' => f.write_str("&lt;")?,
            '>' => f.write_str("&gt;")?,
            '"' => f.write_str("&quot;")?,
            '\'' => f.write_str("&#39;")?,
            other => f.write_char(other)?,
        }
    }
    Ok(())
}
