//! Markdown rendering for outgoing draft bodies.

use pulldown_cmark::{Event, Options, Parser, html};

/// Render a draft body to HTML.
///
/// Every chat message is one body line, so single line breaks are kept as
/// `<br>` instead of being folded into the paragraph.
pub fn render(body: &str) -> String {
    let parser = Parser::new_ext(body, Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TABLES)
        .map(|event| match event {
            Event::SoftBreak => Event::HardBreak,
            other => other,
        });
    let mut out = String::with_capacity(body.len() * 2);
    html::push_html(&mut out, parser);
    normalize(&out)
}

/// Join headings onto the preceding block and collapse blank lines between tags.
fn normalize(rendered: &str) -> String {
    rendered.replace("\n\n<h", "<h").replace(">\n\n", ">")
}

/// Plain-text alternative of a markdown body.
pub fn plain_alternative(body: &str) -> String {
    body.replace("<br>", "\n")
}
