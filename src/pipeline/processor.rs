//! Content pipeline: turns fetched messages into deliveries.
//!
//! Flow per message:
//! 1. Parse (unparseable messages are skipped)
//! 2. Dedup gate: the seen record is inserted before anything is delivered
//! 3. Silenced polls stop here
//! 4. Blocklist check against every sender address
//! 5. Body selection by the room's HTML preference

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::mail::RawMail;
use crate::pipeline::blocklist;
use crate::pipeline::content::ParsedMail;
use crate::pipeline::types::{BatchOutcome, DedupStrategy, Outcome};
use crate::store::{Database, Room};

/// Content pipeline shared by every listener.
pub struct ContentPipeline {
    store: Arc<dyn Database>,
    strategy: DedupStrategy,
}

impl ContentPipeline {
    pub fn new(store: Arc<dyn Database>, strategy: DedupStrategy) -> Self {
        Self { store, strategy }
    }

    /// Process one poll's worth of messages for a room, in order.
    ///
    /// A store failure stops the batch; the outcomes gathered up to that
    /// point are kept alongside it.
    pub async fn process_batch(
        &self,
        room: &Room,
        inbound_id: i64,
        mails: &[RawMail],
        silent: bool,
    ) -> BatchOutcome {
        let mut batch = BatchOutcome {
            outcomes: Vec::with_capacity(mails.len()),
            failure: None,
        };
        let patterns: Vec<String> = match self.store.list_blocklist(inbound_id).await {
            Ok(entries) => entries.into_iter().map(|e| e.pattern).collect(),
            Err(e) => {
                batch.failure = Some(e);
                return batch;
            }
        };

        for raw in mails {
            match self.process_one(room, raw, &patterns, silent).await {
                Ok(outcome) => {
                    debug!(room = %room.key, seq = raw.seq, outcome = outcome.label(), "Mail processed");
                    batch.outcomes.push(outcome);
                }
                Err(e) => {
                    batch.failure = Some(e);
                    break;
                }
            }
        }
        batch
    }

    /// Process a single message against a fresh blocklist.
    pub async fn process(
        &self,
        room: &Room,
        inbound_id: i64,
        raw: &RawMail,
        silent: bool,
    ) -> Result<Outcome, DatabaseError> {
        let mut outcomes = self
            .process_batch(room, inbound_id, std::slice::from_ref(raw), silent)
            .await
            .into_result()?;
        Ok(outcomes.pop().unwrap_or(Outcome::Unparseable))
    }

    async fn process_one(
        &self,
        room: &Room,
        raw: &RawMail,
        patterns: &[String],
        silent: bool,
    ) -> Result<Outcome, DatabaseError> {
        let Some(parsed) = ParsedMail::parse(raw) else {
            return Ok(Outcome::Unparseable);
        };

        let key = parsed.dedup_key(self.strategy);
        if !self.store.mark_mail_seen(room.id, &key).await? {
            return Ok(Outcome::Duplicate);
        }
        if silent {
            return Ok(Outcome::Silenced);
        }

        if let Some(pattern) = blocklist::first_match(patterns, &parsed.sender_addresses) {
            info!(room = %room.key, pattern, "Blocked mail from {}", parsed.from);
            return Ok(Outcome::Blocked {
                pattern: pattern.to_string(),
            });
        }

        Ok(Outcome::Deliver(parsed.into_inbound(room.html_enabled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlBackend, NewInboundAccount};
    use chrono::DateTime;
    use secrecy::SecretString;

    fn mail(from: &str, subject: &str, ts: i64) -> RawMail {
        let date = DateTime::from_timestamp(ts, 0).unwrap().fixed_offset();
        RawMail {
            seq: 1,
            internal_date: Some(date),
            body: format!("From: {from}\r\nSubject: {subject}\r\n\r\nbody\r\n").into_bytes(),
        }
    }

    async fn setup() -> (Arc<dyn Database>, Room, i64) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let room = db.ensure_room("R1", 30, false).await.unwrap();
        let acct = db
            .attach_inbound(
                room.id,
                &NewInboundAccount {
                    host: "imap.example.com:993".into(),
                    username: "alice".into(),
                    secret: SecretString::from("pw"),
                    mailbox: "INBOX".into(),
                    verify_tls: true,
                },
            )
            .await
            .unwrap();
        (db, room, acct.id)
    }

    #[tokio::test]
    async fn second_fetch_is_duplicate() {
        let (db, room, inbound) = setup().await;
        let pipeline = ContentPipeline::new(db.clone(), DedupStrategy::default());
        let m = mail("carol@example.com", "Hi", 1000);

        assert!(matches!(
            pipeline.process(&room, inbound, &m, false).await.unwrap(),
            Outcome::Deliver(_)
        ));
        assert_eq!(
            pipeline.process(&room, inbound, &m, false).await.unwrap(),
            Outcome::Duplicate
        );
        // The seen key is subject + timestamp.
        assert!(!db.mark_mail_seen(room.id, "Hi1000").await.unwrap());
    }

    #[tokio::test]
    async fn blocked_mail_is_still_seen() {
        let (db, room, inbound) = setup().await;
        db.add_blocklist(inbound, "*@spam.io").await.unwrap();
        let pipeline = ContentPipeline::new(db.clone(), DedupStrategy::default());
        let m = mail("bob@spam.io", "Buy now", 2000);

        assert_eq!(
            pipeline.process(&room, inbound, &m, false).await.unwrap(),
            Outcome::Blocked {
                pattern: "*@spam.io".into()
            }
        );
        assert_eq!(
            pipeline.process(&room, inbound, &m, false).await.unwrap(),
            Outcome::Duplicate
        );
    }

    #[tokio::test]
    async fn silenced_batch_records_without_delivery() {
        let (db, room, inbound) = setup().await;
        let pipeline = ContentPipeline::new(db, DedupStrategy::default());
        let batch = vec![mail("a@x.com", "One", 1), mail("b@x.com", "Two", 2)];

        let outcomes = pipeline
            .process_batch(&room, inbound, &batch, true)
            .await
            .into_result()
            .unwrap();
        assert_eq!(outcomes, vec![Outcome::Silenced, Outcome::Silenced]);

        let outcomes = pipeline
            .process_batch(&room, inbound, &batch, false)
            .await
            .into_result()
            .unwrap();
        assert_eq!(outcomes, vec![Outcome::Duplicate, Outcome::Duplicate]);
    }

    #[tokio::test]
    async fn garbage_is_unparseable_and_not_recorded() {
        let (db, room, inbound) = setup().await;
        let pipeline = ContentPipeline::new(db, DedupStrategy::default());
        let empty = RawMail {
            seq: 9,
            internal_date: None,
            body: Vec::new(),
        };
        assert_eq!(
            pipeline.process(&room, inbound, &empty, false).await.unwrap(),
            Outcome::Unparseable
        );
    }

    #[tokio::test]
    async fn html_preference_applies() {
        let (db, mut room, inbound) = setup().await;
        room.html_enabled = true;
        let pipeline = ContentPipeline::new(db, DedupStrategy::default());
        let m = RawMail {
            seq: 1,
            internal_date: None,
            body: b"From: a@x.com\r\nSubject: H\r\nContent-Type: text/html\r\n\r\n<b>bold</b>\r\n"
                .to_vec(),
        };
        match pipeline.process(&room, inbound, &m, false).await.unwrap() {
            Outcome::Deliver(mail) => {
                assert!(mail.is_html);
                assert!(mail.body.contains("<b>bold</b>"));
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn store_failure_keeps_earlier_outcomes() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend
            .conn()
            .execute_batch(
                "CREATE TRIGGER seen_two_fails BEFORE INSERT ON seen_mails
                 WHEN NEW.mail_key = 'Two2'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .await
            .unwrap();
        let db: Arc<dyn Database> = Arc::new(backend);
        let room = db.ensure_room("R1", 30, false).await.unwrap();
        let inbound = db
            .attach_inbound(
                room.id,
                &NewInboundAccount {
                    host: "imap.example.com:993".into(),
                    username: "alice".into(),
                    secret: SecretString::from("pw"),
                    mailbox: "INBOX".into(),
                    verify_tls: true,
                },
            )
            .await
            .unwrap()
            .id;
        let pipeline = ContentPipeline::new(db.clone(), DedupStrategy::default());
        let batch = vec![
            mail("a@x.com", "One", 1),
            mail("b@x.com", "Two", 2),
            mail("c@x.com", "Three", 3),
        ];

        let result = pipeline.process_batch(&room, inbound, &batch, false).await;
        assert!(result.failure.is_some());
        assert_eq!(result.outcomes.len(), 1);
        assert!(matches!(&result.outcomes[0], Outcome::Deliver(m) if m.subject == "One"));

        // Messages after the failure were not recorded and come back next poll.
        assert!(db.mark_mail_seen(room.id, "Three3").await.unwrap());
    }
}
