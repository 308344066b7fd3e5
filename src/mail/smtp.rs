//! SMTP submission via lettre (blocking transport, run in spawn_blocking).

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::error::MailError;
use crate::mail::{MailTransport, OutboundMail};
use crate::store::OutboundAccount;

/// Port on which the server expects TLS from the first byte.
const IMPLICIT_TLS_PORT: u16 = 465;

/// Sends [`OutboundMail`] through the room's outbound account.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmtpMailer;

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, account: &OutboundAccount, mail: OutboundMail) -> Result<(), MailError> {
        let mut files = Vec::with_capacity(mail.attachments.len());
        for attachment in &mail.attachments {
            let data = tokio::fs::read(&attachment.path).await?;
            files.push((attachment.file_name.clone(), data));
        }
        let message = build_message(&mail, files)?;

        let host = account.host.clone();
        let port = account.port;
        let verify = account.verify_tls;
        let creds = Credentials::new(
            account.username.clone(),
            account.secret.expose_secret().to_string(),
        );

        tokio::task::spawn_blocking(move || {
            let transport = build_transport(&host, port, verify, creds)?;
            transport
                .send(&message)
                .map_err(|e| MailError::Send(e.to_string()))?;
            Ok::<_, MailError>(())
        })
        .await
        .map_err(|e| MailError::Task(e.to_string()))??;

        info!(
            host = %account.host,
            recipients = mail.to.len(),
            attachments = mail.attachments.len(),
            "Mail submitted"
        );
        Ok(())
    }
}

fn build_transport(
    host: &str,
    port: u16,
    verify: bool,
    creds: Credentials,
) -> Result<SmtpTransport, MailError> {
    let tls_parameters = TlsParameters::builder(host.to_string())
        .dangerous_accept_invalid_certs(!verify)
        .dangerous_accept_invalid_hostnames(!verify)
        .build()
        .map_err(|e| MailError::Connect {
            host: format!("{host}:{port}"),
            reason: e.to_string(),
        })?;

    let tls = if port == IMPLICIT_TLS_PORT {
        Tls::Wrapper(tls_parameters)
    } else {
        Tls::Opportunistic(tls_parameters)
    };
    debug!(host, port, implicit_tls = port == IMPLICIT_TLS_PORT, "Dialing SMTP");

    Ok(SmtpTransport::builder_dangerous(host)
        .port(port)
        .tls(tls)
        .credentials(creds)
        .build())
}

fn parse_mailbox(addr: &str) -> Result<Mailbox, MailError> {
    addr.trim()
        .parse()
        .map_err(|e| MailError::Build(format!("invalid address {addr:?}: {e}")))
}

fn content_type_for(file_name: &str) -> Result<ContentType, MailError> {
    let guessed = mime_guess::from_path(file_name).first_or_octet_stream();
    ContentType::parse(guessed.essence_str())
        .or_else(|_| ContentType::parse("application/octet-stream"))
        .map_err(|e| MailError::Build(format!("content type for {file_name}: {e}")))
}

/// Lay out the message: plain body, plain+HTML alternative, and a mixed
/// wrapper when files are attached.
pub fn build_message(
    mail: &OutboundMail,
    attachments: Vec<(String, Vec<u8>)>,
) -> Result<Message, MailError> {
    let mut builder = Message::builder()
        .from(parse_mailbox(&mail.from)?)
        .subject(mail.subject.clone());
    for addr in &mail.to {
        builder = builder.to(parse_mailbox(addr)?);
    }

    let built = if attachments.is_empty() {
        match &mail.html {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(
                mail.plain.clone(),
                html.clone(),
            )),
            None => builder.singlepart(SinglePart::plain(mail.plain.clone())),
        }
    } else {
        let mut mixed = match &mail.html {
            Some(html) => MultiPart::mixed().multipart(MultiPart::alternative_plain_html(
                mail.plain.clone(),
                html.clone(),
            )),
            None => MultiPart::mixed().singlepart(SinglePart::plain(mail.plain.clone())),
        };
        for (name, data) in attachments {
            let content_type = content_type_for(&name)?;
            mixed = mixed.singlepart(Attachment::new(name).body(data, content_type));
        }
        builder.multipart(mixed)
    };

    built.map_err(|e| MailError::Build(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::OutboundAttachment;

    fn mail(html: Option<&str>) -> OutboundMail {
        OutboundMail {
            from: "me@example.com".into(),
            to: vec!["x@y.com".into(), "z@y.com".into()],
            subject: "Hello".into(),
            plain: "line1\r\nline2\r\n".into(),
            html: html.map(str::to_string),
            attachments: vec![],
        }
    }

    fn render(message: &Message) -> String {
        String::from_utf8_lossy(&message.formatted()).into_owned()
    }

    #[test]
    fn plain_only_is_single_part() {
        let text = render(&build_message(&mail(None), vec![]).unwrap());
        assert!(text.contains("Subject: Hello"));
        assert!(text.contains("To: x@y.com, z@y.com"));
        assert!(text.contains("text/plain"));
        assert!(!text.contains("multipart/"));
    }

    #[test]
    fn markdown_is_alternative() {
        let text = render(&build_message(&mail(Some("<p>line1<br>line2</p>")), vec![]).unwrap());
        assert!(text.contains("multipart/alternative"));
        assert!(text.contains("text/html"));
        assert!(!text.contains("multipart/mixed"));
    }

    #[test]
    fn attachments_wrap_in_mixed() {
        let mut m = mail(Some("<p>hi</p>"));
        m.attachments.push(OutboundAttachment {
            file_name: "notes.txt".into(),
            path: "/unused".into(),
        });
        let files = vec![("notes.txt".to_string(), b"some notes".to_vec())];
        let text = render(&build_message(&m, files).unwrap());
        assert!(text.contains("multipart/mixed"));
        assert!(text.contains("multipart/alternative"));
        assert!(text.contains("filename=\"notes.txt\""));
    }

    #[test]
    fn bad_recipient_is_build_error() {
        let mut m = mail(None);
        m.to = vec!["not an address".into()];
        assert!(matches!(build_message(&m, vec![]), Err(MailError::Build(_))));
    }

    #[test]
    fn content_type_guessing() {
        assert_eq!(content_type_for("a.pdf").unwrap(), ContentType::parse("application/pdf").unwrap());
        assert_eq!(
            content_type_for("blob.unknownext").unwrap(),
            ContentType::parse("application/octet-stream").unwrap()
        );
    }
}
