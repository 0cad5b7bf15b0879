//-
// Copyright (c) 2025, the Tidemap developers
//
// This file is part of Tidemap.
//
// Tidemap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public License as  published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tidemap is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY; without even the  implied warranty of MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tidemap. If not, see <http://www.gnu.org/licenses/>.

use super::defs::*;

#[test]
fn capability_before_login() {
    let setup = set_up();
    let mut client = setup.connect("capability_before_login");

    skip_greeting(&mut client);
    client.write_line("a001 CAPABILITY").unwrap();
    receive_line_like(&mut client, r"^\* CAPABILITY IMAP4rev1 AUTH=PLAIN");
    receive_line_like(&mut client, r"^a001 OK CAPABILITY completed");
}

#[test]
fn capability_after_login_changes() {
    let setup = set_up();
    let mut client = setup.connect("capability_after_login");

    quick_log_in(&mut client);
    client.write_line("a002 CAPABILITY").unwrap();
    // The authenticated list does not advertise AUTH=PLAIN.
    receive_line_like(&mut client, r"^\* CAPABILITY IMAP4rev1 LITERAL\+");
    receive_line_like(&mut client, r"^a002 OK");
}

#[test]
fn login_then_select_prelude_order() {
    let setup = set_up();
    let mut client = setup.connect("login_then_select");

    skip_greeting(&mut client);
    client.write_line("a002 LOGIN azure hunter2").unwrap();
    receive_line_like(&mut client, r"^a002 OK");

    client.write_line("a003 SELECT INBOX").unwrap();
    receive_line_like(&mut client, r"^\* FLAGS \(\\Answered");
    receive_line_like(&mut client, r"^\* OK \[PERMANENTFLAGS \(");
    receive_line_like(&mut client, r"^\* 0 EXISTS");
    receive_line_like(&mut client, r"^\* 0 RECENT");
    receive_line_like(&mut client, r"^\* OK \[UIDVALIDITY 1\]");
    receive_line_like(&mut client, r"^\* OK \[UIDNEXT 1\]");
    receive_line_like(&mut client, r"^a003 OK \[READ-WRITE\]");
}

#[test]
fn examine_is_read_only() {
    let setup = set_up();
    let mut client = setup.connect("examine_is_read_only");

    quick_log_in(&mut client);
    client.write_line("a1 EXAMINE INBOX").unwrap();
    let lines = read_until_tagged(&mut client, "a1");
    assert!(lines.last().unwrap().starts_with(b"a1 OK [READ-ONLY]"));
}

#[test]
fn login_failure_does_not_change_state() {
    let setup = set_up();
    let mut client = setup.connect("login_failure");

    skip_greeting(&mut client);
    client.write_line("a1 LOGIN azure wrong").unwrap();
    receive_line_like(&mut client, r"^a1 NO \[AUTHENTICATIONFAILED\]");

    // Still unauthenticated: SELECT is rejected.
    client.write_line("a2 SELECT INBOX").unwrap();
    receive_line_like(&mut client, r"^a2 BAD Bad Command");

    // And a second, correct LOGIN works.
    client.write_line("a3 LOGIN azure hunter2").unwrap();
    receive_line_like(&mut client, r"^a3 OK");
}

#[test]
fn authenticate_plain_with_continuation() {
    let setup = set_up();
    let mut client = setup.connect("authenticate_plain");

    skip_greeting(&mut client);
    client.write_line("a1 AUTHENTICATE PLAIN").unwrap();
    receive_line_like(&mut client, r"^\+");
    client
        .write_line(&base64::encode("\x00azure\x00hunter2"))
        .unwrap();
    receive_line_like(&mut client, r"^a1 OK AUTHENTICATE completed");
}

#[test]
fn authenticate_plain_with_initial_response() {
    let setup = set_up();
    let mut client = setup.connect("authenticate_initial");

    skip_greeting(&mut client);
    client
        .write_line(&format!(
            "a1 AUTHENTICATE PLAIN {}",
            base64::encode("\x00azure\x00hunter2")
        ))
        .unwrap();
    receive_line_like(&mut client, r"^a1 OK AUTHENTICATE completed");
}

#[test]
fn authenticate_abort() {
    let setup = set_up();
    let mut client = setup.connect("authenticate_abort");

    skip_greeting(&mut client);
    client.write_line("a1 AUTHENTICATE PLAIN").unwrap();
    receive_line_like(&mut client, r"^\+");
    client.write_line("*").unwrap();
    receive_line_like(&mut client, r"^a1 BAD AUTHENTICATE aborted");
}

#[test]
fn commands_gated_by_state() {
    let setup = set_up();
    let mut client = setup.connect("state_gating");

    skip_greeting(&mut client);
    client.write_line("a1 FETCH 1 FLAGS").unwrap();
    receive_line_like(&mut client, r"^a1 BAD Bad Command");

    quick_log_in(&mut client);
    // FETCH needs a selected mailbox, not just authentication.
    client.write_line("a2 FETCH 1 FLAGS").unwrap();
    receive_line_like(&mut client, r"^a2 BAD Bad Command");
    // LOGIN twice is a state violation too.
    client.write_line("a3 LOGIN azure hunter2").unwrap();
    receive_line_like(&mut client, r"^a3 BAD Bad Command");
}

#[test]
fn oversized_literal_is_rejected_and_session_continues() {
    let setup = set_up();
    let mut client = setup.connect("oversized_literal");

    skip_greeting(&mut client);
    client.write_line("a006 FOO {20000}").unwrap();
    receive_line_like(&mut client, r"^a006 BAD Command line too long");

    client.write_line("a007 NOOP").unwrap();
    receive_line_like(&mut client, r"^a007 OK NOOP completed");
}

#[test]
fn unknown_command_is_bad() {
    let setup = set_up();
    let mut client = setup.connect("unknown_command");

    skip_greeting(&mut client);
    client.write_line("a1 FROBNICATE everything").unwrap();
    receive_line_like(&mut client, r"^a1 BAD \[PARSE\]");

    client.write_line("a2 NOOP").unwrap();
    receive_line_like(&mut client, r"^a2 OK");
}

#[test]
fn logout_says_bye_and_closes() {
    let setup = set_up();
    let mut client = setup.connect("logout");

    skip_greeting(&mut client);
    client.write_line("a009 LOGOUT").unwrap();
    receive_line_like(&mut client, r"^\* BYE");
    receive_line_like(&mut client, r"^a009 OK LOGOUT completed");

    // Nothing further; the server closes the connection.
    let mut buf = Vec::new();
    assert_eq!(0, client.read_line_raw(&mut buf).unwrap());
}

#[test]
fn id_exchange() {
    let setup = set_up();
    let mut client = setup.connect("id_exchange");

    skip_greeting(&mut client);
    client
        .write_line("a1 ID (\"name\" \"tester\" \"version\" \"1\")")
        .unwrap();
    receive_line_like(&mut client, r#"^\* ID \("name" "tidemap""#);
    receive_line_like(&mut client, r"^a1 OK ID completed");
}

#[test]
fn append_with_synchronizing_literal() {
    let setup = set_up();
    let mut client = setup.connect("append_sync");

    quick_log_in(&mut client);
    quick_append(&mut client, "b001", "INBOX", b"Hello\r\nWorld");

    quick_select(&mut client, "INBOX");
    client.write_line("f1 FETCH 1 RFC822.SIZE").unwrap();
    receive_line_like(&mut client, r"^\* 1 FETCH \(RFC822.SIZE 12\)");
    receive_line_like(&mut client, r"^f1 OK");
}

#[test]
fn append_with_nonsync_literal_and_flags() {
    let setup = set_up();
    let mut client = setup.connect("append_nonsync");

    quick_log_in(&mut client);
    client
        .write_line("a1 APPEND INBOX (\\Seen) {5+}")
        .unwrap();
    client.write_raw(b"hello").unwrap();
    client.write_raw(b"\r\n").unwrap();
    receive_line_like(&mut client, r"^a1 OK APPEND completed");

    quick_select(&mut client, "INBOX");
    client.write_line("f1 FETCH 1 FLAGS").unwrap();
    receive_line_like(&mut client, r"^\* 1 FETCH \(FLAGS \(\\Seen\)\)");
    receive_line_like(&mut client, r"^f1 OK");
}

#[test]
fn append_over_size_limit_is_rejected() {
    let setup = set_up();
    let mut client = setup.connect("append_oversize");

    quick_log_in(&mut client);
    client.write_line("a1 APPEND INBOX {99999999}").unwrap();
    receive_line_like(&mut client, r"^a1 BAD \[LIMIT\]");

    client.write_line("a2 NOOP").unwrap();
    receive_line_like(&mut client, r"^a2 OK");
}

#[test]
fn append_to_missing_mailbox_suggests_trycreate() {
    let setup = set_up();
    let mut client = setup.connect("append_trycreate");

    quick_log_in(&mut client);
    client.write_line("a1 APPEND Missing {5}").unwrap();
    receive_line_like(&mut client, r"^\+");
    client.write_raw(b"hello").unwrap();
    client.write_raw(b"\r\n").unwrap();
    receive_line_like(&mut client, r"^a1 NO \[TRYCREATE\]");

    client.write_line("a2 NOOP").unwrap();
    receive_line_like(&mut client, r"^a2 OK");
}

#[test]
fn lappend_injects_before_authentication() {
    let setup = set_up();
    let mut client = setup.connect("lappend");

    skip_greeting(&mut client);
    client.write_line("a1 LAPPEND azure INBOX {7}").unwrap();
    receive_line_like(&mut client, r"^\+");
    client.write_raw(b"injects").unwrap();
    client.write_raw(b"\r\n").unwrap();
    receive_line_like(&mut client, r"^a1 OK LAPPEND completed");

    // The message is visible once the user logs in.
    quick_log_in(&mut client);
    client.write_line("a2 STATUS INBOX (MESSAGES)").unwrap();
    receive_line_like(&mut client, r"^\* STATUS INBOX \(MESSAGES 1\)");
    receive_line_like(&mut client, r"^a2 OK");
}

#[test]
fn lappend_rejected_after_authentication() {
    let setup = set_up();
    let mut client = setup.connect("lappend_gated");

    quick_log_in(&mut client);
    client.write_line("a1 LAPPEND azure INBOX {3}").unwrap();
    receive_line_like(&mut client, r"^\+");
    client.write_raw(b"abc").unwrap();
    client.write_raw(b"\r\n").unwrap();
    receive_line_like(&mut client, r"^a1 BAD Bad Command");
}

#[test]
fn create_list_delete() {
    let setup = set_up();
    let mut client = setup.connect("create_list_delete");

    quick_log_in(&mut client);
    client.write_line("a1 CREATE Archive").unwrap();
    receive_line_like(&mut client, r"^a1 OK CREATE completed");

    client.write_line("a2 LIST \"\" \"*\"").unwrap();
    let lines = read_until_tagged(&mut client, "a2");
    assert!(lines
        .iter()
        .any(|l| l.starts_with(b"* LIST (") && l.ends_with(b"Archive\r\n")));
    assert!(lines.iter().any(
        |l| l.starts_with(b"* LIST (") && l.ends_with(b"INBOX\r\n")
    ));

    client.write_line("a3 DELETE Archive").unwrap();
    receive_line_like(&mut client, r"^a3 OK DELETE completed");

    client.write_line("a4 DELETE Archive").unwrap();
    receive_line_like(&mut client, r"^a4 NO No such mailbox");
}

#[test]
fn subscribe_and_lsub() {
    let setup = set_up();
    let mut client = setup.connect("subscribe_lsub");

    quick_log_in(&mut client);
    client.write_line("a1 SUBSCRIBE INBOX").unwrap();
    receive_line_like(&mut client, r"^a1 OK SUBSCRIBE completed");

    client.write_line("a2 LSUB \"\" \"*\"").unwrap();
    receive_line_like(&mut client, r#"^\* LSUB \(.*\) "/" INBOX"#);
    receive_line_like(&mut client, r"^a2 OK LSUB completed");
}

#[test]
fn status_formats_requested_items_in_order() {
    let setup = set_up();
    let mut client = setup.connect("status_order");

    quick_log_in(&mut client);
    quick_append(&mut client, "a1", "INBOX", b"one");
    quick_append(&mut client, "a2", "INBOX", b"two");

    client
        .write_line("a3 STATUS INBOX (UIDNEXT MESSAGES RECENT)")
        .unwrap();
    receive_line_like(
        &mut client,
        r"^\* STATUS INBOX \(UIDNEXT 3 MESSAGES 2 RECENT 2\)",
    );
    receive_line_like(&mut client, r"^a3 OK STATUS completed");
}

#[test]
fn select_without_uidvalidity_fails() {
    let setup = set_up();
    setup.store.add_mailbox("azure", "Broken", "");
    let mut client = setup.connect("missing_uidvalidity");

    quick_log_in(&mut client);
    client.write_line("a1 SELECT Broken").unwrap();
    receive_line_like(&mut client, r"^a1 NO Mailbox Broken has no UIDVALIDITY");

    // The session is not left half-selected.
    client.write_line("a2 FETCH 1 FLAGS").unwrap();
    receive_line_like(&mut client, r"^a2 BAD Bad Command");
}

#[test]
fn fetch_store_search_expunge_cycle() {
    let setup = set_up();
    let mut client = setup.connect("message_cycle");

    quick_log_in(&mut client);
    quick_append(
        &mut client,
        "a1",
        "INBOX",
        b"From: bob@example.com\r\nSubject: invoice\r\n\r\npay up\r\n",
    );
    quick_append(
        &mut client,
        "a2",
        "INBOX",
        b"From: carol@example.com\r\nSubject: lunch\r\n\r\nnoodles?\r\n",
    );
    quick_select(&mut client, "INBOX");

    client.write_line("a3 SEARCH FROM bob").unwrap();
    receive_line_like(&mut client, r"^\* SEARCH 1\r");
    receive_line_like(&mut client, r"^a3 OK SEARCH completed");

    client.write_line("a4 STORE 1 +FLAGS (\\Deleted)").unwrap();
    receive_line_like(&mut client, r"^\* 1 FETCH \(FLAGS \(\\Deleted\)\)");
    receive_line_like(&mut client, r"^a4 OK STORE completed");

    client.write_line("a5 EXPUNGE").unwrap();
    receive_line_like(&mut client, r"^\* 1 EXPUNGE");
    receive_line_like(&mut client, r"^a5 OK EXPUNGE completed");

    client.write_line("a6 SEARCH ALL").unwrap();
    receive_line_like(&mut client, r"^\* SEARCH 1\r");
    receive_line_like(&mut client, r"^a6 OK");

    client.write_line("a7 FETCH 1 BODY[]").unwrap();
    receive_line_like(&mut client, r"^\* 1 FETCH \(BODY\[\] \{53\}");
    receive_line_like(&mut client, r"^a7 OK FETCH completed");
}

#[test]
fn uid_fetch_reports_uids() {
    let setup = set_up();
    let mut client = setup.connect("uid_fetch");

    quick_log_in(&mut client);
    quick_append(&mut client, "a1", "INBOX", b"one");
    quick_append(&mut client, "a2", "INBOX", b"two");
    quick_select(&mut client, "INBOX");

    client.write_line("a3 UID FETCH 2 FLAGS").unwrap();
    receive_line_like(&mut client, r"^\* 2 FETCH \(UID 2 FLAGS \(\)\)");
    receive_line_like(&mut client, r"^a3 OK");
}

#[test]
fn copy_to_missing_mailbox_suggests_trycreate() {
    let setup = set_up();
    let mut client = setup.connect("copy_trycreate");

    quick_log_in(&mut client);
    quick_append(&mut client, "a1", "INBOX", b"one");
    quick_select(&mut client, "INBOX");

    client.write_line("a2 COPY 1 Missing").unwrap();
    receive_line_like(&mut client, r"^a2 NO \[TRYCREATE\]");

    client.write_line("a3 CREATE Missing").unwrap();
    receive_line_like(&mut client, r"^a3 OK");
    client.write_line("a4 COPY 1 Missing").unwrap();
    receive_line_like(&mut client, r"^a4 OK COPY completed");
}

#[test]
fn close_returns_to_authenticated() {
    let setup = set_up();
    let mut client = setup.connect("close");

    quick_log_in(&mut client);
    quick_select(&mut client, "INBOX");
    client.write_line("a1 CLOSE").unwrap();
    receive_line_like(&mut client, r"^a1 OK CLOSE completed");

    client.write_line("a2 CHECK").unwrap();
    receive_line_like(&mut client, r"^a2 BAD Bad Command");
    // But SELECT works again.
    quick_select(&mut client, "INBOX");
}

#[test]
fn starttls_rejected_when_not_configured() {
    let setup = set_up();
    let mut client = setup.connect("starttls_disabled");

    skip_greeting(&mut client);
    client.write_line("a1 STARTTLS").unwrap();
    receive_line_like(&mut client, r"^a1 BAD STARTTLS is not enabled");
}

#[test]
fn login_with_literal_password() {
    let setup = set_up();
    let mut client = setup.connect("literal_login");

    skip_greeting(&mut client);
    client.write_line("a1 LOGIN azure {7}").unwrap();
    receive_line_like(&mut client, r"^\+");
    client.write_raw(b"hunter2").unwrap();
    client.write_line("").unwrap();
    receive_line_like(&mut client, r"^a1 OK LOGIN completed");
}
