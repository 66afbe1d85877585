//! Normalizes raw RFC 822 bytes into a [`MessageRecord`].

use std::collections::HashSet;

use chrono::{DateTime, Local, NaiveDateTime};
use mailparse::{MailAddr, MailHeaderMap, ParsedMail, addrparse_header};
use mist_core::{Identity, MessageRecord, SourceError};

use crate::source::SourceConfig;

const HTML_RENDER_WIDTH: usize = 100;

pub fn message_record(
    raw: &[u8],
    config: &SourceConfig,
    position: u32,
) -> Result<MessageRecord, SourceError> {
    let parsed = mailparse::parse_mail(raw).map_err(|err| SourceError::Fetch {
        source_id: config.id,
        position,
        reason: err.to_string(),
    })?;

    let sender = header_identities(&parsed, "From").into_iter().next();
    let mut recipients = header_identities(&parsed, "To");
    recipients.extend(header_identities(&parsed, "Cc"));
    let mut seen = HashSet::new();
    recipients.retain(|identity| !identity.id.is_empty() && seen.insert(identity.id.clone()));

    let (from_id, from_name) = sender
        .map(|identity| (identity.id, identity.name))
        .unwrap_or_default();

    Ok(MessageRecord {
        source_id: config.id,
        source_name: config.name.clone(),
        date: header_date(&parsed).unwrap_or_else(|| Local::now().naive_local()),
        from_id,
        from_name,
        recipients,
        subject: parsed
            .headers
            .get_first_value("Subject")
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
        body: select_body(&parsed),
        add_existing_history: config.add_existing_history,
    })
}

/// Addresses of a header; the lower-cased address is the identity key.
fn header_identities(parsed: &ParsedMail, name: &str) -> Vec<Identity> {
    let Some(header) = parsed.headers.get_first_header(name) else {
        return Vec::new();
    };
    let Ok(list) = addrparse_header(header) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for addr in list.iter() {
        match addr {
            MailAddr::Single(info) => out.push(identity(&info.addr, info.display_name.as_deref())),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    out.push(identity(&info.addr, info.display_name.as_deref()));
                }
            }
        }
    }
    out
}

fn identity(addr: &str, display_name: Option<&str>) -> Identity {
    let id = addr.trim().to_lowercase();
    let name = display_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| addr.trim().to_string());
    Identity::new(id, name)
}

/// Strict RFC 2822 first, then the lenient parser for malformed headers.
///
/// The lenient parser yields the epoch for text it cannot read at all, so
/// its result only counts when the header carries a four-digit year.
fn header_date(parsed: &ParsedMail) -> Option<NaiveDateTime> {
    let raw = parsed.headers.get_first_value("Date")?;
    let raw = raw.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(raw) {
        return Some(date.with_timezone(&Local).naive_local());
    }
    if !has_year(raw) {
        return None;
    }
    let epoch = mailparse::dateparse(raw).ok().filter(|epoch| *epoch != 0)?;
    let utc = DateTime::from_timestamp(epoch, 0)?;
    Some(utc.with_timezone(&Local).naive_local())
}

fn has_year(raw: &str) -> bool {
    raw.split(|c: char| !c.is_ascii_digit())
        .any(|token| token.len() == 4)
}

fn select_body(parsed: &ParsedMail) -> String {
    let mut text_plain: Option<String> = None;
    let mut text_html: Option<String> = None;

    walk_parts(parsed, &mut |part| {
        if !part.subparts.is_empty() || is_attachment(part) {
            return;
        }
        let ctype = part.ctype.mimetype.to_lowercase();
        if ctype == "text/plain" && text_plain.is_none() {
            text_plain = part.get_body().ok();
        } else if ctype == "text/html" && text_html.is_none() {
            text_html = part.get_body().ok();
        }
    });

    if let Some(text) = text_plain {
        return text;
    }
    text_html
        .map(|html| html2text::from_read(html.as_bytes(), HTML_RENDER_WIDTH))
        .unwrap_or_default()
}

fn is_attachment(part: &ParsedMail) -> bool {
    matches!(
        part.get_content_disposition().disposition,
        mailparse::DispositionType::Attachment
    )
}

fn walk_parts<F>(parsed: &ParsedMail, cb: &mut F)
where
    F: FnMut(&ParsedMail),
{
    cb(parsed);
    for part in &parsed.subparts {
        walk_parts(part, cb);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn work_config() -> SourceConfig {
        SourceConfig {
            id: 7,
            name: "Work".into(),
            add_existing_history: false,
            ..SourceConfig::default()
        }
    }

    #[test]
    fn plain_message_is_normalized() -> anyhow::Result<()> {
        let raw = b"From: Bambi Deer <Bambi@Toontown.example>\r\n\
To: Thumper <thumper@toontown.example>, flower@toontown.example\r\n\
Cc: THUMPER@toontown.example, Owl <owl@toontown.example>\r\n\
Subject: Email tasks this color (BLACK)\r\n\
Date: Tue, 6 Nov 2007 15:27:21 +0000\r\n\
\r\n\
Spring is here.\r\n";
        let record = message_record(raw, &work_config(), 1)?;

        assert_eq!(record.source_id, 7);
        assert_eq!(record.source_name, "Work");
        assert!(!record.add_existing_history);
        assert_eq!(record.from_id, "bambi@toontown.example");
        assert_eq!(record.from_name, "Bambi Deer");
        assert_eq!(record.subject, "Email tasks this color (BLACK)");
        assert_eq!(record.body.trim(), "Spring is here.");

        let ids: Vec<&str> = record.recipients.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            ["thumper@toontown.example", "flower@toontown.example", "owl@toontown.example"]
        );
        assert_eq!(record.recipients[1].name, "flower@toontown.example");

        let expected = chrono::Utc
            .with_ymd_and_hms(2007, 11, 6, 15, 27, 21)
            .single()
            .map(|utc| utc.with_timezone(&Local).naive_local());
        assert_eq!(Some(record.date), expected);
        Ok(())
    }

    #[test]
    fn missing_date_falls_back_to_now() -> anyhow::Result<()> {
        let before = Local::now().naive_local() - Duration::seconds(1);
        let raw = b"From: a@b.example\r\nSubject: no date\r\n\r\nbody\r\n";
        let record = message_record(raw, &work_config(), 1)?;
        assert!(record.date >= before);
        assert!(record.recipients.is_empty());
        Ok(())
    }

    #[test]
    fn unparsable_date_falls_back_to_now() -> anyhow::Result<()> {
        let before = Local::now().naive_local() - Duration::seconds(1);
        let raw = b"From: a@b.example\r\nDate: sometime last spring\r\n\r\nbody\r\n";
        let record = message_record(raw, &work_config(), 1)?;
        assert!(record.date >= before);
        Ok(())
    }

    #[test]
    fn wordy_dates_without_a_year_fall_back_to_now() -> anyhow::Result<()> {
        let before = Local::now().naive_local() - Duration::seconds(1);
        for date in ["yesterday", "Tue, 6 Nov", ""] {
            let raw = format!("From: a@b.example\r\nDate: {}\r\n\r\nbody\r\n", date);
            let record = message_record(raw.as_bytes(), &work_config(), 1)?;
            assert!(record.date >= before, "{:?} gave {}", date, record.date);
        }
        Ok(())
    }

    #[test]
    fn lenient_date_with_a_year_is_kept() -> anyhow::Result<()> {
        let raw = b"From: a@b.example\r\nDate: 6 Nov 2007 15:27:21 GMT (lunch)\r\n\r\nbody\r\n";
        let record = message_record(raw, &work_config(), 1)?;
        assert_eq!(record.date.date().format("%Y").to_string(), "2007");
        Ok(())
    }

    #[test]
    fn multipart_prefers_plain_text() -> anyhow::Result<()> {
        let raw = b"From: a@b.example\r\n\
Content-Type: multipart/alternative; boundary=\"xyz\"\r\n\
\r\n\
--xyz\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>Hello <b>html</b></p>\r\n\
--xyz\r\n\
Content-Type: text/plain\r\n\
\r\n\
Hello plain\r\n\
--xyz--\r\n";
        let record = message_record(raw, &work_config(), 1)?;
        assert_eq!(record.body.trim(), "Hello plain");
        Ok(())
    }

    #[test]
    fn html_only_is_rendered_as_text() -> anyhow::Result<()> {
        let raw = b"From: a@b.example\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><body><p>Hello <b>there</b></p></body></html>\r\n";
        let record = message_record(raw, &work_config(), 1)?;
        assert!(record.body.contains("Hello"));
        assert!(record.body.contains("there"));
        assert!(!record.body.contains("<p>"));
        Ok(())
    }

    #[test]
    fn missing_headers_leave_fields_empty() -> anyhow::Result<()> {
        let record = message_record(b"\r\njust a body\r\n", &work_config(), 3)?;
        assert!(record.from_id.is_empty());
        assert!(record.subject.is_empty());
        Ok(())
    }
}
