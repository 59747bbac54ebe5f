/// Converts raw message text into display markup.
///
/// Implementations are supplied by the frontend (for example a Markdown
/// renderer). The session only guarantees it calls `render` once per content
/// change.
pub trait ContentRenderer: Send + Sync {
    fn render(&self, text: &str) -> String;
}

/// Fallback renderer: HTML-escapes the text and keeps line breaks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextRenderer;

impl ContentRenderer for PlainTextRenderer {
    fn render(&self, text: &str) -> String {
        escape_html(text).replace('\n', "<br>")
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_markup_and_keeps_breaks() {
        let rendered = PlainTextRenderer.render("<b>hi</b> & \"bye\"\nnext");
        assert_eq!(
            rendered,
            "&lt;b&gt;hi&lt;/b&gt; &amp; &quot;bye&quot;<br>next"
        );
    }
}
