use url::Url;

use crate::caching::{Backend, CacheError, CacheKey, DataStream, MemoryBackend};
use crate::config::CacheMode;
use crate::transaction::{
    Admission, LoadFlags, RequestInfo, ResponseInfo, Role, TransactionId, TransactionMode,
};

use super::*;

fn cache() -> HttpCache<MemoryBackend> {
    netcache_test::setup();
    HttpCache::new(MemoryBackend::new())
}

fn request(url: &str) -> RequestInfo {
    RequestInfo::get(Url::parse(url).unwrap())
}

fn key(url: &str) -> CacheKey {
    CacheKey::builder("GET", &Url::parse(url).unwrap()).build()
}

fn start(cache: &mut HttpCache<MemoryBackend>, request: &RequestInfo) -> (TransactionId, Admission) {
    let transaction = cache.new_transaction();
    let admission = cache.start_transaction(transaction, request).unwrap();
    (transaction, admission)
}

fn write_response(cache: &mut HttpCache<MemoryBackend>, transaction: TransactionId, body: &[u8]) {
    cache
        .write_response_info(transaction, &ResponseInfo::fresh(200, vec![]))
        .unwrap();
    cache
        .write_data(transaction, DataStream::ResponseContent, 0, body, true)
        .unwrap();
}

fn read_body(cache: &HttpCache<MemoryBackend>, transaction: TransactionId) -> Vec<u8> {
    let size = cache
        .data_size(transaction, DataStream::ResponseContent)
        .unwrap();
    let mut buf = vec![0; size];
    let len = cache
        .read_data(transaction, DataStream::ResponseContent, 0, &mut buf)
        .unwrap();
    buf.truncate(len);
    buf
}

/// Runs a complete write of `body` for `request`, leaving nothing active behind.
fn store(cache: &mut HttpCache<MemoryBackend>, request: &RequestInfo, body: &[u8]) {
    let (transaction, admission) = start(cache, request);
    assert_eq!(admission, Admission::Writer);
    write_response(cache, transaction, body);
    cache.finish_writing(transaction, true).unwrap();
    cache.run_pending_tasks();
    cache.detach_transaction(transaction);
    assert_eq!(cache.active_entry_count(), 0);
}

fn from_cache(url: &str) -> RequestInfo {
    request(url).with_load_flags(LoadFlags::ONLY_FROM_CACHE)
}

#[test]
fn test_first_transaction_writes() {
    let mut cache = cache();
    let request = request("http://x/");

    let (t1, admission) = start(&mut cache, &request);
    assert_eq!(admission, Admission::Writer);
    assert_eq!(cache.transaction_mode(t1), Some(TransactionMode::WRITE));
    assert_eq!(cache.active_entry_count(), 1);
    assert_eq!(cache.read_response_info(t1), Err(CacheError::CacheMiss));

    write_response(&mut cache, t1, b"hello");
    cache.finish_writing(t1, true).unwrap();
    assert_eq!(cache.transaction_mode(t1), Some(TransactionMode::NONE));

    // deactivation is deferred
    assert_eq!(cache.active_entry_count(), 1);
    assert!(cache.has_pending_tasks());
    assert_eq!(cache.run_pending_tasks(), 1);
    assert_eq!(cache.active_entry_count(), 0);

    let stored = cache
        .backend()
        .stream(&key("http://x/"), DataStream::ResponseContent)
        .unwrap();
    assert_eq!(stored, b"hello");
}

#[test]
fn test_pending_transaction_reads_written_data() {
    let mut cache = cache();
    let request = request("http://x/");

    let (t1, _) = start(&mut cache, &request);
    let (t2, admission) = start(&mut cache, &request);
    assert_eq!(admission, Admission::Pending);

    let entry = cache.transaction_entry(t1).unwrap();
    assert_eq!(cache.transaction_entry(t2), Some(entry));
    let info = cache.entry_info(entry).unwrap();
    assert_eq!(info.writer, Some(t1));
    assert_eq!(info.pending, vec![t2]);

    write_response(&mut cache, t1, b"hello");
    cache.finish_writing(t1, true).unwrap();
    assert!(cache.take_notifications().is_empty());

    cache.run_pending_tasks();
    insta::assert_debug_snapshot!(cache.take_notifications(), @r###"
    [
        Notification {
            transaction: TransactionId(
                1,
            ),
            outcome: Ok(
                Writer,
            ),
        },
    ]
    "###);

    // the stored response is usable, so the writer becomes a reader
    let info = cache.read_response_info(t2).unwrap();
    assert_eq!(info.status, 200);
    cache.convert_to_reader(t2).unwrap();
    assert_eq!(cache.transaction_role(t2), Some(Role::Reader));
    assert_eq!(read_body(&cache, t2), b"hello");

    cache.finish_reading(t2).unwrap();
    cache.run_pending_tasks();
    assert_eq!(cache.active_entry_count(), 0);
    assert!(cache.entry_info(entry).is_none());
}

#[test]
fn test_readers_share_entry() {
    let mut cache = cache();
    store(&mut cache, &request("http://x/"), b"hello");

    let (t1, admission) = start(&mut cache, &from_cache("http://x/"));
    assert_eq!(admission, Admission::Reader);
    let (t2, admission) = start(&mut cache, &from_cache("http://x/"));
    assert_eq!(admission, Admission::Reader);

    let entry = cache.transaction_entry(t1).unwrap();
    let info = cache.entry_info(entry).unwrap();
    assert_eq!(info.writer, None);
    assert_eq!(info.readers, vec![t1, t2]);

    assert_eq!(read_body(&cache, t1), b"hello");
    assert_eq!(read_body(&cache, t2), b"hello");
    assert_eq!(
        cache.write_data(t1, DataStream::ResponseContent, 0, b"x", true),
        Err(CacheError::NotWriter)
    );

    cache.finish_reading(t1).unwrap();
    assert_eq!(cache.active_entry_count(), 1);
    cache.finish_reading(t2).unwrap();
    assert_eq!(cache.active_entry_count(), 0);
}

#[test]
fn test_pending_queue_is_fifo() {
    let mut cache = cache();
    store(&mut cache, &request("http://x/"), b"hello");

    let (reader, _) = start(&mut cache, &from_cache("http://x/"));
    // a writer waits for the readers to leave, and everybody else waits behind it
    let (t2, admission) = start(&mut cache, &request("http://x/"));
    assert_eq!(admission, Admission::Pending);
    let (t3, admission) = start(&mut cache, &from_cache("http://x/"));
    assert_eq!(admission, Admission::Pending);

    let entry = cache.transaction_entry(reader).unwrap();
    assert_eq!(cache.entry_info(entry).unwrap().pending, vec![t2, t3]);

    cache.finish_reading(reader).unwrap();
    cache.run_pending_tasks();
    let notifications = cache.take_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].transaction, t2);
    assert_eq!(notifications[0].outcome, Ok(Admission::Writer));
    assert_eq!(cache.entry_info(entry).unwrap().pending, vec![t3]);

    cache.convert_to_reader(t2).unwrap();
    cache.run_pending_tasks();
    let notifications = cache.take_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].transaction, t3);
    assert_eq!(notifications[0].outcome, Ok(Admission::Reader));

    let info = cache.entry_info(entry).unwrap();
    assert_eq!(info.readers, vec![t2, t3]);
    assert!(info.pending.is_empty());
}

#[test]
fn test_consecutive_readers_are_admitted() {
    let mut cache = cache();
    store(&mut cache, &request("http://x/"), b"hello");

    let (t1, _) = start(&mut cache, &request("http://x/"));
    assert_eq!(cache.transaction_role(t1), Some(Role::Writer));
    let (t2, _) = start(&mut cache, &from_cache("http://x/"));
    let (t3, _) = start(&mut cache, &from_cache("http://x/"));

    cache.convert_to_reader(t1).unwrap();
    cache.run_pending_tasks();

    let admitted: Vec<_> = cache
        .take_notifications()
        .into_iter()
        .map(|n| (n.transaction, n.outcome))
        .collect();
    assert_eq!(
        admitted,
        vec![(t2, Ok(Admission::Reader)), (t3, Ok(Admission::Reader))]
    );
}

#[test]
fn test_newcomers_queue_behind_scheduled_run() {
    let mut cache = cache();
    let request = request("http://x/");

    let (t1, _) = start(&mut cache, &request);
    let (t2, _) = start(&mut cache, &request);
    write_response(&mut cache, t1, b"hello");
    cache.finish_writing(t1, true).unwrap();

    // the entry has no writer now, but a queue run is already scheduled
    let (t3, admission) = start(&mut cache, &from_cache("http://x/"));
    assert_eq!(admission, Admission::Pending);

    cache.run_pending_tasks();
    let notifications = cache.take_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].transaction, t2);

    let entry = cache.transaction_entry(t2).unwrap();
    assert_eq!(cache.entry_info(entry).unwrap().pending, vec![t3]);
}

#[test]
fn test_writer_failure_restarts_pending() {
    let mut cache = cache();
    let request = request("http://x/");

    let (t1, _) = start(&mut cache, &request);
    let (t2, _) = start(&mut cache, &request);
    let (t3, _) = start(&mut cache, &request);
    let failed_entry = cache.transaction_entry(t1).unwrap();

    cache
        .write_data(t1, DataStream::ResponseContent, 0, b"partial", false)
        .unwrap();
    cache.finish_writing(t1, false).unwrap();

    // the failed entry is gone right away
    assert!(cache.entry_info(failed_entry).is_none());
    assert!(!cache.backend().contains(&key("http://x/")));

    // everybody who was waiting starts over against a fresh entry
    let notifications = cache.take_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].transaction, t2);
    assert_eq!(notifications[0].outcome, Ok(Admission::Writer));

    let entry = cache.transaction_entry(t2).unwrap();
    assert_ne!(entry, failed_entry);
    assert_eq!(cache.transaction_entry(t3), Some(entry));
    assert_eq!(cache.entry_info(entry).unwrap().pending, vec![t3]);

    // the partial data is never seen
    assert_eq!(cache.read_response_info(t2), Err(CacheError::CacheMiss));
    assert_eq!(
        cache.data_size(t2, DataStream::ResponseContent),
        Ok(0)
    );

    write_response(&mut cache, t2, b"complete");
    cache.finish_writing(t2, true).unwrap();
    cache.run_pending_tasks();
    let notifications = cache.take_notifications();
    assert_eq!(notifications[0].transaction, t3);
    assert_eq!(read_body(&cache, t3), b"complete");
}

#[test]
fn test_detached_writer_dooms_entry() {
    let mut cache = cache();
    let request = request("http://x/");

    let (t1, _) = start(&mut cache, &request);
    let (t2, _) = start(&mut cache, &request);
    write_response(&mut cache, t1, b"hello");
    cache.detach_transaction(t1);

    assert_eq!(cache.transaction_mode(t1), None);
    assert_eq!(cache.transaction_role(t2), Some(Role::Writer));
    assert_eq!(cache.read_response_info(t2), Err(CacheError::CacheMiss));
    assert!(!cache.backend().contains(&key("http://x/")));
}

#[test]
fn test_detached_pending_transaction_is_removed() {
    let mut cache = cache();
    let request = request("http://x/");

    let (t1, _) = start(&mut cache, &request);
    let (t2, _) = start(&mut cache, &request);
    let entry = cache.transaction_entry(t1).unwrap();

    assert!(cache.remove_pending_transaction(t2));
    assert!(!cache.remove_pending_transaction(t2));
    assert!(cache.entry_info(entry).unwrap().pending.is_empty());
    assert_eq!(cache.transaction_entry(t2), None);

    cache.finish_writing(t1, true).unwrap();
    cache.run_pending_tasks();
    assert!(cache.take_notifications().is_empty());
    assert_eq!(cache.active_entry_count(), 0);
}

#[test]
fn test_doom_active_entry() {
    let mut cache = cache();
    let request = request("http://x/");

    let (t1, _) = start(&mut cache, &request);
    let (t2, _) = start(&mut cache, &request);
    let doomed = cache.transaction_entry(t1).unwrap();

    assert!(cache.doom_entry(&key("http://x/")));
    assert_eq!(cache.active_entry_count(), 0);
    assert_eq!(cache.doomed_entry_count(), 1);
    assert!(cache.entry_info(doomed).unwrap().doomed);
    assert_eq!(cache.find_active_entry(&key("http://x/")), None);

    // the queued transaction is restarted in a later task
    assert!(cache.take_notifications().is_empty());
    cache.run_pending_tasks();
    let notifications = cache.take_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].transaction, t2);
    assert_eq!(notifications[0].outcome, Ok(Admission::Writer));
    let fresh = cache.transaction_entry(t2).unwrap();
    assert_ne!(fresh, doomed);

    // the writer of the doomed entry finishes undisturbed
    write_response(&mut cache, t1, b"old");
    cache.finish_writing(t1, true).unwrap();
    cache.run_pending_tasks();
    assert_eq!(cache.doomed_entry_count(), 0);
    assert!(cache.entry_info(doomed).is_none());
    assert_eq!(cache.active_entry_count(), 1);
    assert!(!cache.backend().contains(&key("http://x/")));

    write_response(&mut cache, t2, b"new");
    cache.finish_writing(t2, true).unwrap();
    cache.run_pending_tasks();
    assert_eq!(cache.active_entry_count(), 0);
    let stored = cache
        .backend()
        .stream(&key("http://x/"), DataStream::ResponseContent)
        .unwrap();
    assert_eq!(stored, b"new");
}

#[test]
fn test_doomed_entry_finalized_once_drained() {
    let mut cache = cache();
    store(&mut cache, &request("http://x/"), b"hello");

    let (t1, _) = start(&mut cache, &from_cache("http://x/"));
    let (t2, _) = start(&mut cache, &from_cache("http://x/"));
    let entry = cache.transaction_entry(t1).unwrap();

    cache.doom_entry(&key("http://x/"));
    assert_eq!(cache.doomed_entry_count(), 1);

    // nobody new gets to see the doomed entry
    let t3 = cache.new_transaction();
    assert_eq!(
        cache.start_transaction(t3, &from_cache("http://x/")),
        Err(CacheError::CacheMiss)
    );

    assert_eq!(read_body(&cache, t1), b"hello");
    cache.finish_reading(t1).unwrap();
    assert_eq!(cache.doomed_entry_count(), 1);
    cache.finish_reading(t2).unwrap();
    assert_eq!(cache.doomed_entry_count(), 0);
    assert!(cache.entry_info(entry).is_none());

    // releasing again is a noop
    cache.done_reading_from_entry(entry, t2);
    cache.deactivate_entry(entry);
    assert_eq!(cache.run_pending_tasks(), 0);
}

#[test]
fn test_doomed_entry_takes_no_transactions() {
    let mut cache = cache();
    store(&mut cache, &request("http://x/"), b"hello");

    let (t1, admission) = start(&mut cache, &from_cache("http://x/"));
    assert_eq!(admission, Admission::Reader);
    let entry = cache.transaction_entry(t1).unwrap();
    cache.doom_entry(&key("http://x/"));

    let t2 = cache.new_transaction();
    assert_eq!(
        cache.add_transaction_to_entry(entry, t2),
        Err(CacheError::EntryDoomed)
    );
    assert_eq!(cache.transaction_entry(t2), None);

    let info = cache.entry_info(entry).unwrap();
    assert!(info.doomed);
    assert_eq!(info.readers, vec![t1]);
    assert!(info.pending.is_empty());

    cache.finish_reading(t1).unwrap();
    assert_eq!(cache.doomed_entry_count(), 0);
}

#[test]
fn test_attached_transaction_is_not_added_again() {
    let mut cache = cache();
    let (t1, _) = start(&mut cache, &request("http://x/"));
    let (t2, admission) = start(&mut cache, &request("http://x/"));
    assert_eq!(admission, Admission::Pending);
    let entry = cache.transaction_entry(t1).unwrap();

    assert_eq!(
        cache.add_transaction_to_entry(entry, t1),
        Err(CacheError::AlreadyAttached)
    );
    assert_eq!(
        cache.add_transaction_to_entry(entry, t2),
        Err(CacheError::AlreadyAttached)
    );

    let info = cache.entry_info(entry).unwrap();
    assert_eq!(info.writer, Some(t1));
    assert_eq!(info.pending, vec![t2]);
}

#[test]
fn test_doom_idle_key() {
    let mut cache = cache();
    store(&mut cache, &request("http://x/"), b"hello");
    assert!(cache.backend().contains(&key("http://x/")));

    assert!(!cache.doom_entry(&key("http://x/")));
    assert!(!cache.backend().contains(&key("http://x/")));
    assert_eq!(cache.doomed_entry_count(), 0);
}

#[test]
fn test_bypass_cache_replaces_entry() {
    let mut cache = cache();
    store(&mut cache, &request("http://x/"), b"old");

    let request = request("http://x/").with_header("Cache-Control", "no-cache");
    let (t1, admission) = start(&mut cache, &request);
    assert_eq!(admission, Admission::Writer);
    assert_eq!(cache.transaction_mode(t1), Some(TransactionMode::WRITE));
    assert_eq!(cache.read_response_info(t1), Err(CacheError::CacheMiss));
}

#[test]
fn test_read_write_keeps_existing_entry() {
    let mut cache = cache();
    store(&mut cache, &request("http://x/"), b"old");

    let (t1, admission) = start(&mut cache, &request("http://x/"));
    assert_eq!(admission, Admission::Writer);
    assert_eq!(cache.transaction_mode(t1), Some(TransactionMode::READ_WRITE));
    assert_eq!(cache.read_response_info(t1).unwrap().status, 200);
    assert_eq!(read_body(&cache, t1), b"old");
}

#[test]
fn test_external_validation() {
    let mut cache = cache();
    let request = request("http://x/").with_header("If-None-Match", "\"abc\"");

    // nothing to update yet
    let (t1, admission) = start(&mut cache, &request);
    assert_eq!(admission, Admission::Bypass);
    assert_eq!(cache.transaction_mode(t1), Some(TransactionMode::NONE));

    store(&mut cache, &self::request("http://x/"), b"hello");
    let (t2, admission) = start(&mut cache, &request);
    assert_eq!(admission, Admission::Writer);
    assert_eq!(cache.transaction_mode(t2), Some(TransactionMode::UPDATE));

    let t3 = cache.new_transaction();
    let request = from_cache("http://x/").with_header("If-None-Match", "\"abc\"");
    assert_eq!(
        cache.start_transaction(t3, &request),
        Err(CacheError::CacheMiss)
    );
}

#[test]
fn test_truncated_response() {
    let mut cache = cache();
    let (t1, _) = start(&mut cache, &request("http://x/"));
    let mut info = ResponseInfo::fresh(200, vec![("Content-Length".into(), "10".into())]);
    info.truncated = true;
    cache.write_response_info(t1, &info).unwrap();
    cache.finish_writing(t1, true).unwrap();
    cache.run_pending_tasks();

    let (t2, _) = start(&mut cache, &from_cache("http://x/"));
    assert_eq!(cache.read_response_info(t2), Err(CacheError::CacheMiss));
    cache.finish_reading(t2).unwrap();

    // a writer gets to see it, and can resume the download
    let (t3, _) = start(&mut cache, &request("http://x/"));
    let info = cache.read_response_info(t3).unwrap();
    assert!(info.truncated);
    assert_eq!(info.header("content-length"), Some("10"));
}

#[test]
fn test_malformed_response_info() {
    let mut cache = cache();
    let (t1, _) = start(&mut cache, &request("http://x/"));
    cache
        .write_data(t1, DataStream::ResponseInfo, 0, b"{not json", true)
        .unwrap();
    assert_eq!(cache.read_response_info(t1), Err(CacheError::ReadFailure));
}

#[test]
fn test_pass_through() {
    let mut cache = cache();
    let url = Url::parse("http://x/form").unwrap();

    let (_, admission) = start(&mut cache, &RequestInfo::new("POST", url.clone()));
    assert_eq!(admission, Admission::Bypass);
    let (_, admission) = start(&mut cache, &RequestInfo::new("PUT", url.clone()));
    assert_eq!(admission, Admission::Bypass);
    let (_, admission) = start(&mut cache, &request("http://x/").with_header("Range", "bytes=0-1"));
    assert_eq!(admission, Admission::Bypass);
    let (_, admission) = start(
        &mut cache,
        &request("http://x/").with_load_flags(LoadFlags::DISABLE_CACHE),
    );
    assert_eq!(admission, Admission::Bypass);
    assert_eq!(cache.active_entry_count(), 0);

    let post = RequestInfo::new("POST", url).with_upload_id(42);
    let (t1, admission) = start(&mut cache, &post);
    assert_eq!(admission, Admission::Writer);
    let entry = cache.transaction_entry(t1).unwrap();
    assert_eq!(
        cache.entry_info(entry).unwrap().key.metadata(),
        "POST:42/http://x/form"
    );
}

#[test]
fn test_cache_modes() {
    let backend = MemoryBackend::new();
    netcache_test::setup();

    let mut playback = HttpCache::new(backend.clone()).with_mode(CacheMode::Playback);
    let t1 = playback.new_transaction();
    assert_eq!(
        playback.start_transaction(t1, &request("http://x/")),
        Err(CacheError::CacheMiss)
    );

    // recording never reads, and caches what would otherwise pass through
    let mut record = HttpCache::new(backend.clone()).with_mode(CacheMode::Record);
    let (t2, admission) = start(&mut record, &request("http://x/"));
    assert_eq!(admission, Admission::Writer);
    assert_eq!(record.transaction_mode(t2), Some(TransactionMode::WRITE));
    write_response(&mut record, t2, b"recorded");
    record.finish_writing(t2, true).unwrap();
    record.run_pending_tasks();

    let (t3, admission) = start(&mut playback, &request("http://x/"));
    assert_eq!(admission, Admission::Reader);
    assert_eq!(read_body(&playback, t3), b"recorded");

    let mut disabled = HttpCache::new(backend).with_mode(CacheMode::Disable);
    let (_, admission) = start(&mut disabled, &request("http://x/"));
    assert_eq!(admission, Admission::Bypass);
}

#[test]
fn test_backend_failures_degrade() {
    let mut cache = cache();
    store(&mut cache, &request("http://x/"), b"hello");

    cache.backend().set_fail_opens(true);
    let t1 = cache.new_transaction();
    assert_eq!(
        cache.start_transaction(t1, &from_cache("http://x/")),
        Err(CacheError::CacheMiss)
    );

    cache.backend().set_fail_creates(true);
    let (t2, admission) = start(&mut cache, &request("http://x/"));
    assert_eq!(admission, Admission::Bypass);
    assert_eq!(cache.transaction_mode(t2), Some(TransactionMode::NONE));
    assert_eq!(cache.active_entry_count(), 0);
    assert_eq!(cache.read_response_info(t2), Err(CacheError::NotAttached));
}

#[test]
fn test_key_headers() {
    netcache_test::setup();
    let mut cache = HttpCache::new(MemoryBackend::new())
        .with_key_headers(vec!["accept-language".into()]);

    let de = request("http://x/").with_header("Accept-Language", "de");
    let en = request("http://x/").with_header("Accept-Language", "en");
    let (t1, admission) = start(&mut cache, &de);
    assert_eq!(admission, Admission::Writer);
    let (t2, admission) = start(&mut cache, &en);
    assert_eq!(admission, Admission::Writer);

    assert_ne!(cache.transaction_entry(t1), cache.transaction_entry(t2));
    assert_eq!(cache.active_entry_count(), 2);
}

#[test]
fn test_unknown_transaction() {
    let mut cache = cache();
    let (t1, _) = start(&mut cache, &request("http://x/"));
    let entry = cache.transaction_entry(t1).unwrap();
    cache.detach_transaction(t1);

    assert_eq!(
        cache.start_transaction(t1, &request("http://x/")),
        Err(CacheError::UnknownTransaction)
    );
    assert_eq!(
        cache.add_transaction_to_entry(entry, t1),
        Err(CacheError::UnknownTransaction)
    );
    assert_eq!(cache.finish_writing(t1, true), Err(CacheError::UnknownTransaction));
}

#[test]
fn test_restarting_a_transaction_detaches_it() {
    let mut cache = cache();
    let (t1, _) = start(&mut cache, &request("http://x/"));
    let first = cache.transaction_entry(t1).unwrap();

    assert_eq!(
        cache.start_transaction(t1, &request("http://x/other")),
        Ok(Admission::Writer)
    );
    // the abandoned write dooms the first entry
    assert!(cache.entry_info(first).is_none());
    assert_eq!(cache.active_entry_count(), 1);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "already active")]
fn test_activate_entry_twice() {
    let mut cache = cache();
    let key = key("http://x/");

    let disk_entry = cache.backend_mut().create_entry(&key).unwrap();
    cache.activate_entry(key.clone(), disk_entry).unwrap();
    let disk_entry = cache.backend_mut().create_entry(&key).unwrap();
    let _ = cache.activate_entry(key, disk_entry);
}

#[test]
#[cfg(not(debug_assertions))]
fn test_activate_entry_twice() {
    let mut cache = cache();
    let key = key("http://x/");

    let disk_entry = cache.backend_mut().create_entry(&key).unwrap();
    let entry = cache.activate_entry(key.clone(), disk_entry).unwrap();
    let disk_entry = cache.backend_mut().create_entry(&key).unwrap();
    assert_eq!(
        cache.activate_entry(key.clone(), disk_entry),
        Err(CacheError::EntryAlreadyActive("GET:http://x/".into()))
    );
    assert_eq!(cache.find_active_entry(&key), Some(entry));
}
