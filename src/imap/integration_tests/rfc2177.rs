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

//! IDLE and the cross-session notification fan-out.

use super::defs::*;

#[test]
fn idle_and_done() {
    let setup = set_up();
    let mut client = setup.connect("idle_and_done");

    quick_log_in(&mut client);
    quick_select(&mut client, "INBOX");

    client.write_line("a005 IDLE").unwrap();
    receive_line_like(&mut client, r"^\+ idling");

    client.write_line("DONE").unwrap();
    receive_line_like(&mut client, r"^a005 OK IDLE completed");

    // The session is fully usable afterwards.
    client.write_line("a006 NOOP").unwrap();
    receive_line_like(&mut client, r"^a006 OK");
}

#[test]
fn done_is_case_insensitive() {
    let setup = set_up();
    let mut client = setup.connect("done_case");

    quick_log_in(&mut client);
    quick_select(&mut client, "INBOX");

    client.write_line("a1 IDLE").unwrap();
    receive_line_like(&mut client, r"^\+ idling");
    client.write_line("done").unwrap();
    receive_line_like(&mut client, r"^a1 OK IDLE completed");
}

#[test]
fn non_done_during_idle_is_rejected_with_idle_tag() {
    let setup = set_up();
    let mut client = setup.connect("expected_done");

    quick_log_in(&mut client);
    quick_select(&mut client, "INBOX");

    client.write_line("a007 IDLE").unwrap();
    receive_line_like(&mut client, r"^\+ idling");

    client.write_line("a008 NOOP").unwrap();
    receive_line_like(&mut client, r"^a007 BAD Expected DONE");

    // The session survives and has left IDLE.
    client.write_line("a009 NOOP").unwrap();
    receive_line_like(&mut client, r"^a009 OK");
}

#[test]
fn idle_before_authentication_is_rejected() {
    let setup = set_up();
    let mut client = setup.connect("idle_unauthenticated");

    skip_greeting(&mut client);
    client.write_line("a1 IDLE").unwrap();
    receive_line_like(&mut client, r"^a1 BAD Bad Command");
}

#[test]
fn append_notifies_sibling_idler() {
    let setup = set_up();

    // Session A selects INBOX and goes idle.
    let mut session_a = setup.connect("idler");
    quick_log_in(&mut session_a);
    quick_select(&mut session_a, "INBOX");
    session_a.write_line("a005 IDLE").unwrap();
    receive_line_like(&mut session_a, r"^\+ idling");

    // Session B, same user, appends a message.
    let mut session_b = setup.connect("appender");
    quick_log_in(&mut session_b);
    quick_append(&mut session_b, "b001", "INBOX", b"Hello\r\nWorld");

    // A hears about it without having sent anything.
    receive_line_like(&mut session_a, r"^\* 1 EXISTS");
    receive_line_like(&mut session_a, r"^\* 1 RECENT");

    // The tagged IDLE response only arrives after DONE.
    session_a.write_line("DONE").unwrap();
    receive_line_like(&mut session_a, r"^a005 OK IDLE completed");
}

#[test]
fn store_notifies_sibling_idler() {
    let setup = set_up();

    let mut session_a = setup.connect("store_idler");
    quick_log_in(&mut session_a);
    quick_append(&mut session_a, "p1", "INBOX", b"seed");
    quick_select(&mut session_a, "INBOX");
    session_a.write_line("a1 IDLE").unwrap();
    receive_line_like(&mut session_a, r"^\+ idling");

    let mut session_b = setup.connect("storer");
    quick_log_in(&mut session_b);
    quick_select(&mut session_b, "INBOX");
    session_b.write_line("b1 STORE 1 +FLAGS (\\Flagged)").unwrap();
    receive_line_like(&mut session_b, r"^\* 1 FETCH ");
    receive_line_like(&mut session_b, r"^b1 OK STORE completed");

    receive_line_like(&mut session_a, r"^\* 1 EXISTS");
    receive_line_like(&mut session_a, r"^\* 0 RECENT");

    session_a.write_line("DONE").unwrap();
    receive_line_like(&mut session_a, r"^a1 OK IDLE completed");
}

#[test]
fn idler_of_other_user_is_not_notified() {
    let setup = set_up();
    setup.store.add_user("marigold", "sunflower");

    let mut session_a = setup.connect("other_idler");
    skip_greeting(&mut session_a);
    session_a
        .write_line("L1 LOGIN marigold sunflower")
        .unwrap();
    receive_line_like(&mut session_a, r"^L1 OK");
    quick_select(&mut session_a, "INBOX");
    session_a.write_line("a1 IDLE").unwrap();
    receive_line_like(&mut session_a, r"^\+ idling");

    let mut session_b = setup.connect("azure_appender");
    quick_log_in(&mut session_b);
    quick_append(&mut session_b, "b1", "INBOX", b"for azure only");

    // Nothing for marigold's idler; the next line it sees is its own
    // DONE response.
    session_a.write_line("DONE").unwrap();
    receive_line_like(&mut session_a, r"^a1 OK IDLE completed");
}
