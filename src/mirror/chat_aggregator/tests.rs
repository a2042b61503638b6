//! Tests for chat identity derivation and chat list aggregation.

#[cfg(test)]
mod integration_tests {
    use super::super::*;
    use crate::test_utils::{group_event, stored, text_event};
    use crate::types::Participant;

    #[test]
    fn test_group_event_resolves_to_group_id() {
        let event = group_event("G1", "S1", 10, "hello");
        assert_eq!(derive_chat_id(&event).unwrap(), ChatId::from("G1"));

        let mut ours = group_event("G1", "me", 11, "reply");
        ours.from_me = true;
        assert_eq!(derive_chat_id(&ours).unwrap(), ChatId::from("G1"));
    }

    #[test]
    fn test_individual_chat_resolves_to_other_party_in_both_directions() {
        let inbound = text_event("P", false, 1, "hi");
        let outbound = text_event("P", true, 2, "hey");

        assert_eq!(derive_chat_id(&inbound).unwrap(), ChatId::from("P"));
        assert_eq!(derive_chat_id(&outbound).unwrap(), ChatId::from("P"));
        assert_eq!(outbound.sender.id, "me");
    }

    #[test]
    fn test_missing_ids_are_errors() {
        let mut event = text_event("P", false, 1, "hi");
        event.sender = Participant::default();
        assert_eq!(derive_chat_id(&event), Err(AggregationError::MissingSenderId));

        let mut group = group_event("G1", "S1", 1, "hi");
        group.chat = Participant::default();
        assert_eq!(derive_chat_id(&group), Err(AggregationError::MissingChatId));
    }

    #[test]
    fn test_derive_chat_id_is_independent_of_call_order() {
        let events = vec![
            group_event("G1", "S1", 1, "a"),
            text_event("P", false, 2, "b"),
            text_event("Q", true, 3, "c"),
        ];

        let forward: Vec<_> = events.iter().map(|e| derive_chat_id(e).unwrap()).collect();
        let mut backward: Vec<_> = events.iter().rev().map(|e| derive_chat_id(e).unwrap()).collect();
        backward.reverse();
        let repeated: Vec<_> = events.iter().map(|e| derive_chat_id(e).unwrap()).collect();

        assert_eq!(forward, backward);
        assert_eq!(forward, repeated);
    }

    #[test]
    fn test_scenario_three_group_events_and_two_individual_events() {
        let names = NameDirectory::new();
        let events = vec![
            stored(1, group_event("G", "S1", 100, "first")),
            stored(2, group_event("G", "S1", 300, "third")),
            stored(3, group_event("G", "S1", 200, "second")),
            stored(4, text_event("P", true, 150, "sent by me")),
            stored(5, text_event("P", false, 250, "reply from P")),
        ];

        let summaries = summarize_chats(&events, &names);

        assert_eq!(summaries.len(), 2);
        let group = summaries.iter().find(|s| s.chat_id == ChatId::from("G")).unwrap();
        assert_eq!(group.chat_type, ChatType::Group);
        assert_eq!(group.last_activity_timestamp, 300);
        assert_eq!(group.last_preview, "third");

        let person = summaries.iter().find(|s| s.chat_id == ChatId::from("P")).unwrap();
        assert_eq!(person.chat_type, ChatType::Individual);
        assert_eq!(person.last_preview, "reply from P");
        assert!(!person.last_from_me);
        assert_eq!(person.participant_count_estimate, 2);
    }

    #[test]
    fn test_summaries_are_sorted_most_recent_first() {
        let names = NameDirectory::new();
        let events = vec![
            stored(1, text_event("A", false, 10, "a")),
            stored(2, text_event("B", false, 30, "b")),
            stored(3, text_event("C", false, 20, "c")),
        ];

        let order: Vec<_> = summarize_chats(&events, &names)
            .into_iter()
            .map(|s| s.chat_id)
            .collect();

        assert_eq!(order, vec![ChatId::from("B"), ChatId::from("C"), ChatId::from("A")]);
    }

    #[test]
    fn test_group_participant_estimate_counts_distinct_senders_and_self() {
        let names = NameDirectory::new();
        let mut ours = group_event("G", "me", 4, "mine");
        ours.from_me = true;
        let events = vec![
            stored(1, group_event("G", "S1", 1, "a")),
            stored(2, group_event("G", "S2", 2, "b")),
            stored(3, group_event("G", "S1", 3, "c")),
            stored(4, ours),
        ];

        let summaries = summarize_chats(&events, &names);

        assert_eq!(summaries[0].participant_count_estimate, 3);
        assert!(summaries[0].last_from_me);
    }

    #[test]
    fn test_same_timestamp_goes_to_later_append() {
        let names = NameDirectory::new();
        let events = vec![
            stored(1, text_event("P", false, 10, "earlier append")),
            stored(2, text_event("P", false, 10, "later append")),
        ];

        let summaries = summarize_chats(&events, &names);
        assert_eq!(summaries[0].last_preview, "later append");
    }

    #[test]
    fn test_missing_moment_uses_received_at() {
        let names = NameDirectory::new();
        let mut event = text_event("P", false, 0, "no moment");
        event.moment = None;
        let mut record = stored(1, event);
        record.received_at = 777;

        let summaries = summarize_chats(&[record], &names);
        assert_eq!(summaries[0].last_activity_timestamp, 777);
    }

    #[test]
    fn test_malformed_events_are_skipped() {
        let names = NameDirectory::new();
        let mut broken = text_event("P", false, 5, "lost");
        broken.sender = Participant::default();
        let events = vec![stored(1, broken), stored(2, text_event("Q", false, 6, "kept"))];

        let summaries = summarize_chats(&events, &names);

        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].chat_id, ChatId::from("Q"));
    }

    #[test]
    fn test_display_name_prefers_event_name_then_directory_then_phone() {
        let names = NameDirectory::new();
        let mut named = text_event("5511987654321", false, 1, "hi");
        named.sender = Participant::new("5511987654321", Some("Ana"));
        let anonymous = text_event("5511912345678", true, 2, "hello");

        let summaries = summarize_chats(&[stored(1, named), stored(2, anonymous)], &names);

        let ana = summaries
            .iter()
            .find(|s| s.chat_id == ChatId::from("5511987654321"))
            .unwrap();
        assert_eq!(ana.display_name, "Ana");

        let unknown = summaries
            .iter()
            .find(|s| s.chat_id == ChatId::from("5511912345678"))
            .unwrap();
        assert_eq!(unknown.display_name, "+55 11 91234-5678");
    }

    #[test]
    fn test_apply_reports_only_newer_events() {
        let names = NameDirectory::new();
        let mut list = ChatList::new();

        let newer = list
            .apply(&stored(1, text_event("P", false, 20, "new")), &names, &[])
            .unwrap();
        assert!(newer.is_some());

        let older = list
            .apply(&stored(2, text_event("P", false, 10, "old")), &names, &[])
            .unwrap();
        assert!(older.is_none());
        assert_eq!(list.get(&ChatId::from("P")).unwrap().last_preview, "new");
    }
}
