/*
 * imap_session.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portalettere, a multi-tenant email server.
 *
 * Portalettere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portalettere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portalettere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! End-to-end IMAP session scenarios over in-memory stores.

mod common;

use common::{imap_context, ImapClient};

const SAMPLE: &[u8] = b"From: s@ex.com\r\nTo: alice@ex.com\r\nSubject: Hi\r\n\r\nBody\r\n";

#[tokio::test]
async fn login_disabled_on_insecure_transport() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect_with_security(ctx, false).await;
    let lines = client.cmd("CAPABILITY").await;
    assert!(lines[0].contains("LOGINDISABLED"));
    assert!(lines[0].contains("STARTTLS"));
    let lines = client.cmd("LOGIN alice@ex.com secret").await;
    assert!(lines.last().unwrap().contains("NO [PRIVACYREQUIRED]"));
}

#[tokio::test]
async fn authenticate_plain_roundtrip() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    let tag = client.make_tag();
    client.send(&format!("{} AUTHENTICATE PLAIN", tag)).await;
    let cont = client.line().await;
    assert!(cont.starts_with('+'), "expected continuation: {}", cont);
    // base64("\0bob@ex.com\0pw")
    client.send("AGJvYkBleC5jb20AcHc=").await;
    let lines = client.collect(&tag).await;
    assert!(
        lines.last().unwrap().starts_with(&format!("{} OK [CAPABILITY", tag)),
        "authenticate failed: {:?}",
        lines
    );
}

#[tokio::test]
async fn commands_require_authentication() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    let lines = client.cmd("SELECT INBOX").await;
    assert!(lines.last().unwrap().contains("NO Please authenticate first"));
}

#[tokio::test]
async fn select_reports_counts_and_uid_state() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    client.append("INBOX", SAMPLE).await;
    let lines = client.cmd("SELECT INBOX").await;
    assert!(lines.iter().any(|l| l == "* 1 EXISTS"), "{:?}", lines);
    assert!(lines.iter().any(|l| l == "* 1 RECENT"), "{:?}", lines);
    assert!(lines.iter().any(|l| l.starts_with("* OK [UNSEEN 1]")));
    assert!(lines.iter().any(|l| l.starts_with("* OK [UIDVALIDITY ")));
    assert!(lines.iter().any(|l| l.starts_with("* OK [UIDNEXT ")));
    assert!(lines
        .iter()
        .any(|l| l.starts_with("* FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)")));
    assert!(lines.last().unwrap().contains("OK [READ-WRITE]"));

    // The recent set was consumed by this SELECT.
    let lines = client.cmd("SELECT INBOX").await;
    assert!(lines.iter().any(|l| l == "* 0 RECENT"), "{:?}", lines);
}

#[tokio::test]
async fn fetch_flags_and_size() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    client.append("INBOX", SAMPLE).await;
    client.cmd("SELECT INBOX").await;
    let lines = client.cmd("FETCH 1 (FLAGS RFC822.SIZE)").await;
    let expected = format!("* 1 FETCH (FLAGS () RFC822.SIZE {})", SAMPLE.len());
    assert!(lines.contains(&expected), "{:?}", lines);
}

#[tokio::test]
async fn fetch_on_empty_mailbox_yields_only_ok() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    client.cmd("SELECT INBOX").await;
    let lines = client.cmd("FETCH 1:* (FLAGS)").await;
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("OK FETCH completed"));
}

#[tokio::test]
async fn fetch_body_sets_seen_but_peek_does_not() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    client.append("INBOX", SAMPLE).await;
    client.cmd("SELECT INBOX").await;

    client.cmd("FETCH 1 BODY.PEEK[]").await;
    let lines = client.cmd("FETCH 1 (FLAGS)").await;
    assert!(lines.contains(&"* 1 FETCH (FLAGS ())".to_string()), "{:?}", lines);

    client.cmd("FETCH 1 BODY[]").await;
    let lines = client.cmd("FETCH 1 (FLAGS)").await;
    assert!(
        lines.contains(&"* 1 FETCH (FLAGS (\\Seen))".to_string()),
        "{:?}",
        lines
    );
}

#[tokio::test]
async fn fetch_header_fields_and_partial() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    client.append("INBOX", SAMPLE).await;
    client.cmd("SELECT INBOX").await;

    let lines = client
        .cmd("FETCH 1 BODY.PEEK[HEADER.FIELDS (Subject)]")
        .await;
    let joined = lines.join("\n");
    // "Subject: Hi" CRLF + terminating CRLF = 15 octets.
    assert!(joined.contains("{15}"), "{:?}", lines);
    assert!(joined.contains("Subject: Hi"), "{:?}", lines);

    // Past-the-end partial is the empty literal.
    let lines = client.cmd("FETCH 1 BODY.PEEK[TEXT]<10.5>").await;
    assert!(
        lines.iter().any(|l| l.contains("BODY[TEXT]<10> {0}")),
        "{:?}",
        lines
    );
}

#[tokio::test]
async fn store_flag_algebra() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    client.append("INBOX", SAMPLE).await;
    client.cmd("SELECT INBOX").await;

    let lines = client.cmd("STORE 1 +FLAGS (\\Seen)").await;
    assert!(lines.contains(&"* 1 FETCH (FLAGS (\\Seen))".to_string()), "{:?}", lines);

    let lines = client.cmd("STORE 1 +FLAGS (\\Flagged)").await;
    assert!(
        lines.contains(&"* 1 FETCH (FLAGS (\\Seen \\Flagged))".to_string()),
        "{:?}",
        lines
    );

    let lines = client.cmd("STORE 1 -FLAGS (\\Seen)").await;
    assert!(
        lines.contains(&"* 1 FETCH (FLAGS (\\Flagged))".to_string()),
        "{:?}",
        lines
    );

    let lines = client.cmd("STORE 1 FLAGS.SILENT (\\Deleted)").await;
    assert_eq!(lines.len(), 1, "silent store must not emit untagged: {:?}", lines);
    assert!(lines[0].contains("OK STORE completed"));

    let lines = client.cmd("STORE 1 BOGUS (\\Seen)").await;
    assert!(lines.last().unwrap().contains("BAD"));
}

#[tokio::test]
async fn copy_preserves_and_allocates_contiguously() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    client.cmd("CREATE Archive").await;
    for _ in 0..3 {
        client.append("INBOX", SAMPLE).await;
    }
    client.cmd("SELECT INBOX").await;
    client.cmd("STORE 2 +FLAGS (\\Flagged)").await;

    let lines = client.cmd("COPY 2:3 Archive").await;
    let tagged = lines.last().unwrap();
    assert!(tagged.contains("OK [COPYUID"), "{:?}", lines);
    assert!(tagged.contains("2:3 1:2"), "{:?}", lines);

    // Source is unchanged; destination got both with flags kept and recent.
    let lines = client.cmd("STATUS INBOX (MESSAGES)").await;
    assert!(lines.iter().any(|l| l.contains("MESSAGES 3")));
    let lines = client.cmd("SELECT Archive").await;
    assert!(lines.iter().any(|l| l == "* 2 EXISTS"), "{:?}", lines);
    assert!(lines.iter().any(|l| l == "* 2 RECENT"), "{:?}", lines);
    let lines = client.cmd("UID FETCH 1:* (FLAGS)").await;
    assert!(
        lines.iter().any(|l| l.contains("FLAGS (\\Flagged") && l.contains("UID 1")),
        "{:?}",
        lines
    );
}

#[tokio::test]
async fn copy_to_missing_mailbox_suggests_trycreate() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    client.append("INBOX", SAMPLE).await;
    client.cmd("SELECT INBOX").await;
    let lines = client.cmd("COPY 1 Nowhere").await;
    assert!(lines.last().unwrap().contains("NO [TRYCREATE]"));
}

#[tokio::test]
async fn expunge_renumbers_as_it_deletes() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    for _ in 0..3 {
        client.append("INBOX", SAMPLE).await;
    }
    client.cmd("SELECT INBOX").await;
    client.cmd("STORE 1,3 +FLAGS (\\Deleted)").await;
    let lines = client.cmd("EXPUNGE").await;
    let untagged: Vec<&String> = lines.iter().filter(|l| l.ends_with("EXPUNGE")).collect();
    assert_eq!(untagged, vec!["* 1 EXPUNGE", "* 2 EXPUNGE"], "{:?}", lines);

    // Only the undeleted message remains.
    let lines = client.cmd("FETCH 1:* (FLAGS)").await;
    let fetches = lines.iter().filter(|l| l.contains("FETCH")).count();
    assert_eq!(fetches, 1);
}

#[tokio::test]
async fn uids_are_stable_across_reselect() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;

    let lines = client.cmd("SELECT INBOX").await;
    let validity1 = extract_bracketed(&lines, "UIDVALIDITY");
    let uidnext1: u32 = extract_bracketed(&lines, "UIDNEXT").parse().unwrap();

    let lines = client.append("INBOX", SAMPLE).await;
    let appenduid = lines.last().unwrap();
    assert!(
        appenduid.contains(&format!("APPENDUID {} {}", validity1, uidnext1)),
        "{:?}",
        lines
    );

    client.cmd("UNSELECT").await;
    let lines = client.cmd("SELECT INBOX").await;
    assert_eq!(extract_bracketed(&lines, "UIDVALIDITY"), validity1);
    let uidnext2: u32 = extract_bracketed(&lines, "UIDNEXT").parse().unwrap();
    assert!(uidnext2 >= uidnext1 + 1);

    let lines = client.cmd(&format!("UID FETCH {} (UID)", uidnext1)).await;
    assert!(
        lines.iter().any(|l| l.contains(&format!("UID {}", uidnext1))),
        "{:?}",
        lines
    );
}

#[tokio::test]
async fn examine_is_read_only() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    client.append("INBOX", SAMPLE).await;
    let lines = client.cmd("EXAMINE INBOX").await;
    assert!(lines.iter().any(|l| l.contains("PERMANENTFLAGS ()")));
    assert!(lines.last().unwrap().contains("OK [READ-ONLY]"));

    let lines = client.cmd("STORE 1 +FLAGS (\\Deleted)").await;
    assert!(lines.last().unwrap().contains("NO [READ-ONLY]"), "{:?}", lines);
    let lines = client.cmd("EXPUNGE").await;
    assert!(lines.last().unwrap().contains("NO [READ-ONLY]"), "{:?}", lines);
}

#[tokio::test]
async fn mailbox_lifecycle_and_list() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;

    client.cmd("CREATE a/b/c").await;
    let lines = client.cmd("LIST \"\" *").await;
    for name in ["\"a\"", "\"a/b\"", "\"a/b/c\"", "\"INBOX\""] {
        assert!(lines.iter().any(|l| l.ends_with(name)), "{} in {:?}", name, lines);
    }

    // % does not cross the delimiter.
    let lines = client.cmd("LIST \"\" %").await;
    assert!(lines.iter().any(|l| l.ends_with("\"a\"")));
    assert!(!lines.iter().any(|l| l.ends_with("\"a/b\"")));

    let lines = client.cmd("CREATE INBOX").await;
    assert!(lines.last().unwrap().contains("NO"));
    let lines = client.cmd("DELETE a").await;
    assert!(lines.last().unwrap().contains("NO"), "has children: {:?}", lines);
    let lines = client.cmd("DELETE Trash").await;
    assert!(lines.last().unwrap().contains("NO"));

    client.cmd("RENAME a/b x").await;
    let lines = client.cmd("LIST \"\" *").await;
    assert!(lines.iter().any(|l| l.ends_with("\"x/c\"")), "{:?}", lines);
}

#[tokio::test]
async fn lsub_synthesizes_noselect_parent() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;

    client.cmd("SUBSCRIBE Work/Projects").await;
    // Subscribing twice is idempotent.
    let lines = client.cmd("SUBSCRIBE Work/Projects").await;
    assert!(lines.last().unwrap().contains("OK"));

    let lines = client.cmd("LSUB \"\" %").await;
    let lsubs: Vec<&String> = lines.iter().filter(|l| l.starts_with("* LSUB")).collect();
    assert_eq!(lsubs, vec!["* LSUB (\\Noselect) \"/\" \"Work\""], "{:?}", lines);

    let lines = client.cmd("UNSUBSCRIBE Work/Projects").await;
    assert!(lines.last().unwrap().contains("OK"));
    let lines = client.cmd("UNSUBSCRIBE Work/Projects").await;
    assert!(lines.last().unwrap().contains("NO"));
}

#[tokio::test]
async fn search_by_flags_content_and_uid() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    client
        .append("INBOX", b"From: amy@x.com\r\nSubject: apples\r\n\r\nred fruit\r\n")
        .await;
    client
        .append("INBOX", b"From: bob@y.com\r\nSubject: bricks\r\n\r\nbuilding material\r\n")
        .await;
    client.cmd("SELECT INBOX").await;
    client.cmd("STORE 1 +FLAGS (\\Seen)").await;

    let lines = client.cmd("SEARCH SEEN").await;
    assert!(lines.contains(&"* SEARCH 1".to_string()), "{:?}", lines);
    let lines = client.cmd("SEARCH UNSEEN").await;
    assert!(lines.contains(&"* SEARCH 2".to_string()), "{:?}", lines);
    let lines = client.cmd("SEARCH FROM amy").await;
    assert!(lines.contains(&"* SEARCH 1".to_string()), "{:?}", lines);
    let lines = client.cmd("SEARCH BODY building").await;
    assert!(lines.contains(&"* SEARCH 2".to_string()), "{:?}", lines);
    let lines = client.cmd("SEARCH OR SUBJECT apples SUBJECT bricks").await;
    assert!(lines.contains(&"* SEARCH 1 2".to_string()), "{:?}", lines);
    let lines = client.cmd("UID SEARCH SUBJECT bricks").await;
    assert!(lines.contains(&"* SEARCH 2".to_string()), "{:?}", lines);
    let lines = client.cmd("SEARCH SUBJECT nothing").await;
    assert!(lines.contains(&"* SEARCH".to_string()), "{:?}", lines);
    let lines = client.cmd("SEARCH CHARSET KOI8-R ALL").await;
    assert!(
        lines.last().unwrap().contains("NO [BADCHARSET (US-ASCII UTF-8)]"),
        "{:?}",
        lines
    );
}

#[tokio::test]
async fn status_and_namespace() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    client.append("INBOX", SAMPLE).await;
    let lines = client.cmd("STATUS INBOX (MESSAGES UNSEEN UIDNEXT)").await;
    assert!(
        lines.iter().any(|l| l.contains("MESSAGES 1") && l.contains("UNSEEN 1")),
        "{:?}",
        lines
    );
    let lines = client.cmd("NAMESPACE").await;
    assert!(lines[0].contains("((\"\" \"/\"))"), "{:?}", lines);
    assert!(lines[0].contains("Roles/"), "{:?}", lines);
}

#[tokio::test]
async fn close_expunges_silently_and_unselects() {
    let ctx = imap_context().await;
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;
    client.append("INBOX", SAMPLE).await;
    client.cmd("SELECT INBOX").await;
    client.cmd("STORE 1 +FLAGS (\\Deleted)").await;
    let lines = client.cmd("CLOSE").await;
    assert_eq!(lines.len(), 1, "CLOSE is silent: {:?}", lines);
    let lines = client.cmd("FETCH 1 (FLAGS)").await;
    assert!(lines.last().unwrap().contains("NO"), "unselected: {:?}", lines);
    let lines = client.cmd("SELECT INBOX").await;
    assert!(lines.iter().any(|l| l == "* 0 EXISTS"), "{:?}", lines);
}

#[tokio::test]
async fn append_respects_the_size_cap_boundary() {
    use portalettere_core::authclient::AuthClient;
    use portalettere_core::protocol::imap::ImapContext;
    use portalettere_core::store::StorePool;

    let auth_url = common::spawn_auth_endpoint(true).await;
    let mut config = common::test_config(&auth_url);
    // "From: a@b" CRLF CRLF "x" CRLF = 16 octets.
    config.max_size = 16;
    let ctx = std::sync::Arc::new(ImapContext {
        auth: AuthClient::new(config.auth_url.clone(), false),
        pool: std::sync::Arc::new(StorePool::open_in_memory().unwrap()),
        config: std::sync::Arc::new(config),
    });
    let mut client = ImapClient::connect(ctx).await;
    client.login("alice@ex.com").await;

    let exact = b"From: a@b\r\n\r\nx\r\n";
    assert_eq!(exact.len(), 16);
    let lines = client.append("INBOX", exact).await;
    assert!(lines.last().unwrap().contains("OK [APPENDUID"), "{:?}", lines);

    let over = b"From: a@b\r\n\r\nxy\r\n";
    let tag = client.make_tag();
    client
        .send(&format!("{} APPEND INBOX {{{}}}", tag, over.len()))
        .await;
    let reply = client.line().await;
    assert!(
        reply.starts_with(&format!("{} NO", tag)),
        "oversized literal must be refused without continuation: {}",
        reply
    );
}

#[tokio::test]
async fn idle_reports_new_arrivals() {
    let ctx = imap_context().await;
    let mut watcher = ImapClient::connect(ctx.clone()).await;
    watcher.login("alice@ex.com").await;
    watcher.append("INBOX", SAMPLE).await;
    watcher.cmd("SELECT INBOX").await;

    let tag = watcher.make_tag();
    watcher.send(&format!("{} IDLE", tag)).await;
    let cont = watcher.line().await;
    assert!(cont.starts_with("+ idling"), "{}", cont);

    let mut other = ImapClient::connect(ctx).await;
    other.login("alice@ex.com").await;
    other.append("INBOX", SAMPLE).await;

    // The 2 s poll picks up the new message.
    let line = watcher.line().await;
    assert_eq!(line, "* 2 EXISTS");
    let line = watcher.line().await;
    assert_eq!(line, "* 1 RECENT");

    watcher.send("DONE").await;
    let lines = watcher.collect(&tag).await;
    assert!(lines.last().unwrap().contains("OK IDLE terminated"), "{:?}", lines);
}

#[tokio::test]
async fn role_mailboxes_require_assignment() {
    use portalettere_core::store::TenantId;

    let ctx = imap_context().await;
    let catalog = ctx.pool.catalog();
    let (bob, _, _) = catalog.ensure_user("bob", "ex.com").unwrap();
    let role = catalog.create_role("support@ex.com").unwrap();
    catalog.assign_role(role, bob).unwrap();
    ctx.pool.tenant(TenantId::Role(role)).unwrap();

    let mut bob_client = ImapClient::connect(ctx.clone()).await;
    bob_client.login("bob@ex.com").await;
    let lines = bob_client.cmd("LIST \"\" *").await;
    assert!(
        lines.iter().any(|l| l.contains("Roles/support@ex.com/INBOX")),
        "{:?}",
        lines
    );
    let lines = bob_client.cmd("SELECT Roles/support@ex.com/INBOX").await;
    assert!(lines.last().unwrap().contains("OK [READ-WRITE]"), "{:?}", lines);

    let mut carol = ImapClient::connect(ctx.clone()).await;
    carol.login("carol@ex.com").await;
    let lines = carol.cmd("SELECT Roles/support@ex.com/INBOX").await;
    assert!(
        lines.last().unwrap().contains("NO [AUTHORIZATIONFAILED]"),
        "{:?}",
        lines
    );
}

fn extract_bracketed(lines: &[String], key: &str) -> String {
    let marker = format!("[{} ", key);
    for line in lines {
        if let Some(start) = line.find(&marker) {
            let rest = &line[start + marker.len()..];
            if let Some(end) = rest.find(']') {
                return rest[..end].to_string();
            }
        }
    }
    panic!("no {} in {:?}", key, lines);
}
