//! Formatting of inbound mail as chat messages.

use crate::channels::ChatSink;
use crate::error::ChannelError;
use crate::pipeline::InboundMail;
use crate::pipeline::content::html_to_plain;

const RULE: &str = "────────────────────────────────────";

/// Plain and HTML variants of the "new mail" header.
pub fn header(mail: &InboundMail) -> (String, String) {
    let from = html_escape::encode_text(&mail.from);
    let plain = format!(
        "\n{RULE}\n## You've got a new Email from {from}\nSubject: {}\n{RULE}",
        mail.subject
    );
    let html = format!(
        "<br>{RULE}<br><b>You've got a new Email</b> from <b>{from}</b><br>Subject: {}<br>{RULE}",
        html_escape::encode_text(&mail.subject)
    );
    (plain, html)
}

fn attachment_line(mail: &InboundMail) -> Option<String> {
    if mail.attachment_names.is_empty() {
        None
    } else {
        Some(format!("Attachments: {}", mail.attachment_names.join(", ")))
    }
}

/// Send the header, then the body, to `room`.
pub async fn deliver(
    chat: &dyn ChatSink,
    room: &str,
    mail: &InboundMail,
) -> Result<(), ChannelError> {
    let (plain, html) = header(mail);
    chat.send_formatted(room, &plain, &html).await?;

    let attachments = attachment_line(mail);
    if mail.is_html {
        let mut fallback = html_to_plain(&mail.body);
        let mut body = mail.body.clone();
        if let Some(line) = &attachments {
            fallback.push_str(&format!("\n{line}"));
            body.push_str(&format!("<br>{}", html_escape::encode_text(line)));
        }
        chat.send_formatted(room, &fallback, &body).await
    } else {
        let mut body = mail.body.clone();
        if let Some(line) = &attachments {
            if !body.is_empty() && !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(line);
        }
        if body.trim().is_empty() {
            return Ok(());
        }
        chat.send_text(room, &body).await
    }
}
