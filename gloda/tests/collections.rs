use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gloda_datastore::types::{
    ContactData, ConversationData, GlodaItem, ItemRef, MessageData, MessageText, Resolution,
    NOUN_CONTACT, NOUN_CONVERSATION, NOUN_IDENTITY, NOUN_MESSAGE,
};
use gloda_datastore::types::{downcast_item, GlodaContact, GlodaIdentity, GlodaMessage};
use gloda_datastore::{Collection, CollectionListener, Datastore, DatastoreConfig, Query};

fn datastore() -> Arc<Datastore> {
    Datastore::open_in_memory(DatastoreConfig::default()).unwrap()
}

async fn located_message(ds: &Datastore, conversation_id: i64, key: i64) -> Arc<GlodaMessage> {
    let message = ds
        .create_message(MessageData {
            folder_id: Some(1),
            message_key: Some(key),
            conversation_id,
            ..Default::default()
        })
        .unwrap();
    message.set_text(MessageText {
        subject: Some(format!("message {}", key)),
        ..Default::default()
    });
    ds.insert_message(&message).unwrap().await.unwrap();
    message
}

#[derive(Default)]
struct Recorder {
    added: Mutex<Vec<i64>>,
    modified: AtomicUsize,
    removed: Mutex<Vec<i64>>,
    completed: AtomicUsize,
}

impl CollectionListener for Recorder {
    fn on_items_added(&self, items: &[ItemRef], _collection: &Collection) {
        if let Ok(mut added) = self.added.lock() {
            added.extend(items.iter().map(|i| i.id()));
        }
    }

    fn on_items_modified(&self, items: &[ItemRef], _collection: &Collection) {
        self.modified.fetch_add(items.len(), Ordering::SeqCst);
    }

    fn on_items_removed(&self, items: &[ItemRef], _collection: &Collection) {
        if let Ok(mut removed) = self.removed.lock() {
            removed.extend(items.iter().map(|i| i.id()));
        }
    }

    fn on_query_completed(&self, _collection: &Collection) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_same_row_is_the_same_instance_across_queries() {
    let ds = datastore();
    let conversation = ds.create_conversation(ConversationData::default()).unwrap();
    let message = located_message(&ds, conversation.id(), 1).await;
    ds.collection_manager().clear();

    let first = ds
        .query(Query::id_in(NOUN_MESSAGE, vec![message.id()]), None)
        .await
        .unwrap();
    let second = ds.query(Query::new(NOUN_MESSAGE), None).await.unwrap();

    let a = first.get(message.id()).unwrap();
    let b = second.get(message.id()).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &(message.clone() as ItemRef)));
}

#[tokio::test]
async fn test_parent_links_are_resolved_or_absent() {
    let ds = datastore();
    let conversation = ds.create_conversation(ConversationData::default()).unwrap();
    let with_parent = located_message(&ds, conversation.id(), 1).await;
    let orphan = located_message(&ds, 999, 2).await;
    ds.collection_manager().clear();

    let items = ds.load(Query::new(NOUN_MESSAGE)).await.unwrap();
    assert_eq!(items.len(), 2);
    for item in &items {
        match item.state().link("conversation") {
            Resolution::One(parent) => {
                assert_eq!(item.id(), with_parent.id());
                assert_eq!(parent.noun_id(), NOUN_CONVERSATION);
                assert_eq!(parent.id(), conversation.id());
            }
            Resolution::Absent => assert_eq!(item.id(), orphan.id()),
            other => panic!("message {} left unresolved: {:?}", item.id(), other),
        }
    }
}

#[tokio::test]
async fn test_contact_identity_cycle_loads_and_links() {
    let ds = datastore();
    let contact = ds
        .create_contact(ContactData {
            name: "Ada".to_string(),
            ..Default::default()
        })
        .unwrap();
    ds.insert_contact(&contact).unwrap().await.unwrap();
    let identity = ds
        .create_identity(contact.id(), "email", "ada@example.com", Some("work"), false)
        .unwrap();
    ds.drain().await;
    let (contact_id, identity_id) = (contact.id(), identity.id());
    drop(contact);
    drop(identity);
    ds.collection_manager().clear();

    let items = ds
        .load(Query::id_in(NOUN_IDENTITY, vec![identity_id]))
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    let identity = downcast_item::<GlodaIdentity>(&items[0]).unwrap();
    assert_eq!(identity.description.as_deref(), Some("work"));

    let contact: Arc<GlodaContact> = identity.contact().unwrap();
    assert_eq!(contact.id(), contact_id);
    let identities = contact.identities();
    assert_eq!(identities.len(), 1);
    assert!(Arc::ptr_eq(&identities[0], &identity));
}

#[tokio::test]
async fn test_live_collection_follows_inserts_and_deletes() {
    let ds = datastore();
    let recorder = Arc::new(Recorder::default());
    let collection = ds
        .query(Query::new(NOUN_CONVERSATION), Some(recorder.clone()))
        .await
        .unwrap();
    assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);

    let conversation = ds
        .create_conversation(ConversationData {
            subject: Some("hello".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert!(collection.contains(conversation.id()));
    assert_eq!(recorder.added.lock().unwrap().as_slice(), &[conversation.id()]);

    ds.delete_conversation_by_id(conversation.id())
        .unwrap()
        .await
        .unwrap();
    assert!(collection.is_empty());
    assert_eq!(recorder.removed.lock().unwrap().as_slice(), &[conversation.id()]);
}

#[tokio::test]
async fn test_moved_messages_are_reported_modified() {
    let ds = datastore();
    let message = located_message(&ds, 1, 1).await;
    let recorder = Arc::new(Recorder::default());
    let _collection = ds
        .query(Query::new(NOUN_MESSAGE), Some(recorder.clone()))
        .await
        .unwrap();

    ds.update_message_locations(&[message.id()], &[40], 2, false)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(recorder.modified.load(Ordering::SeqCst), 1);

    ds.update_message_locations(&[message.id()], &[41], 3, true)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(recorder.modified.load(Ordering::SeqCst), 1);
    assert_eq!(message.message_key(), Some(41));
}

#[tokio::test]
async fn test_freshly_inserted_message_is_handed_out_resolved() {
    let ds = datastore();
    let conversation = ds.create_conversation(ConversationData::default()).unwrap();
    let message = located_message(&ds, conversation.id(), 1).await;
    assert!(!message.state().link("conversation").is_resolved());

    let items = ds.load(Query::new(NOUN_MESSAGE)).await.unwrap();
    assert_eq!(items.len(), 1);
    assert!(Arc::ptr_eq(&items[0], &(message.clone() as ItemRef)));
    match message.state().link("conversation") {
        Resolution::One(parent) => assert!(Arc::ptr_eq(&parent, &(conversation.clone() as ItemRef))),
        other => panic!("conversation link is {:?}", other),
    }
    assert!(message.conversation().is_some());
}

#[tokio::test]
async fn test_created_contact_gets_its_identities_on_query() {
    let ds = datastore();
    let contact = ds
        .create_contact(ContactData {
            name: "Grace".to_string(),
            ..Default::default()
        })
        .unwrap();
    ds.insert_contact(&contact).unwrap().await.unwrap();
    let identity = ds
        .create_identity(contact.id(), "email", "grace@example.com", None, false)
        .unwrap();
    ds.drain().await;

    let items = ds.load(Query::new(NOUN_CONTACT)).await.unwrap();
    assert_eq!(items.len(), 1);
    let loaded = downcast_item::<GlodaContact>(&items[0]).unwrap();
    assert!(Arc::ptr_eq(&loaded, &contact));
    let identities = contact.identities();
    assert_eq!(identities.len(), 1);
    assert!(Arc::ptr_eq(&identities[0], &identity));
    let owner = identity.contact().unwrap();
    assert!(Arc::ptr_eq(&owner, &contact));
}

#[tokio::test]
async fn test_identity_from_sync_lookup_is_resolved_by_query() {
    let ds = datastore();
    let contact = ds
        .create_contact(ContactData {
            name: "Alan".to_string(),
            ..Default::default()
        })
        .unwrap();
    ds.insert_contact(&contact).unwrap().await.unwrap();
    let identity = ds
        .create_identity(contact.id(), "email", "alan@example.com", None, false)
        .unwrap();
    ds.drain().await;
    drop(contact);
    drop(identity);
    ds.collection_manager().clear();

    let looked_up = ds.get_identity("email", "alan@example.com").unwrap().unwrap();
    assert!(looked_up.contact().is_none());

    let items = ds
        .load(Query::id_in(NOUN_IDENTITY, vec![looked_up.id()]))
        .await
        .unwrap();
    let identity = downcast_item::<GlodaIdentity>(&items[0]).unwrap();
    assert!(Arc::ptr_eq(&identity, &looked_up));
    let contact = identity.contact().unwrap();
    assert_eq!(contact.name(), "Alan");
    assert!(Arc::ptr_eq(&contact.identities()[0], &identity));
}
