use crate::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use proptest::prelude::*;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;

#[derive(Clone, Copy, Debug)]
struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        // Deterministic, dependency-free PRNG for tests.
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0
    }

    fn gen_range_u64(&mut self, start: u64, end_exclusive: u64) -> u64 {
        debug_assert!(start < end_exclusive);
        let span = end_exclusive - start;
        start + (self.next_u64() % span)
    }

    fn gen_range_usize(&mut self, start: usize, end_exclusive: usize) -> usize {
        self.gen_range_u64(start as u64, end_exclusive as u64) as usize
    }

    fn gen_range_i64(&mut self, start: i64, end_inclusive: i64) -> i64 {
        let span = (end_inclusive - start + 1) as u64;
        start + (self.next_u64() % span) as i64
    }

    fn gen_bool(&mut self) -> bool {
        (self.next_u64() & 1) == 1
    }
}

const PLACEHOLDER: u32 = 0;

/// Editable in-memory source. Values are `1..=n` so they never collide with [`PLACEHOLDER`].
struct VecSource {
    items: Mutex<Vec<u32>>,
    fetches: AtomicUsize,
    short_by: usize,
    sink: Mutex<Option<SourceSink<u32>>>,
    observable: bool,
}

impl VecSource {
    fn new(n: usize) -> Arc<Self> {
        Arc::new(Self::build(n, 0, false))
    }

    fn build(n: usize, short_by: usize, observable: bool) -> Self {
        Self {
            items: Mutex::new((1..=n as u32).collect()),
            fetches: AtomicUsize::new(0),
            short_by,
            sink: Mutex::new(None),
            observable,
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<u32> {
        self.items.lock().clone()
    }

    /// Appends behind the cache's back and notifies it, like an observable store would.
    fn push_external(&self, value: u32) {
        self.items.lock().push(value);
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink(SourceChange::Added(vec![value]));
        }
    }

    fn reset_external(&self) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink(SourceChange::Reset);
        }
    }
}

impl PagedSource<u32> for VecSource {
    fn count(&self) -> Result<usize> {
        Ok(self.items.lock().len())
    }

    fn items_at(&self, offset: usize, count: usize) -> Result<Vec<u32>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let items = self.items.lock();
        let mut out: Vec<u32> = items.iter().skip(offset).take(count).copied().collect();
        out.truncate(count.saturating_sub(self.short_by));
        Ok(out)
    }

    fn index_of(&self, item: &u32) -> Result<Option<usize>> {
        Ok(self.items.lock().iter().position(|x| x == item))
    }

    fn editable(&self) -> Option<&dyn EditableSource<u32>> {
        Some(self)
    }

    fn observe(&self, sink: SourceSink<u32>) -> bool {
        if self.observable {
            *self.sink.lock() = Some(sink);
        }
        self.observable
    }
}

impl EditableSource<u32> for VecSource {
    fn on_append(&self, item: &u32, _updated_at: Option<Timestamp>) -> Result<()> {
        self.items.lock().push(*item);
        Ok(())
    }

    fn on_insert(&self, index: usize, item: &u32, _updated_at: Option<Timestamp>) -> Result<()> {
        self.items.lock().insert(index, *item);
        Ok(())
    }

    fn on_replace(
        &self,
        index: usize,
        _old: Option<&u32>,
        new: &u32,
        _updated_at: Option<Timestamp>,
    ) -> Result<()> {
        self.items.lock()[index] = *new;
        Ok(())
    }

    fn on_remove(
        &self,
        index: usize,
        _item: Option<&u32>,
        _updated_at: Option<Timestamp>,
    ) -> Result<Option<u32>> {
        Ok(Some(self.items.lock().remove(index)))
    }
}

/// Async source whose fetches wait until the gate is opened.
struct GatedSource {
    items: Arc<Mutex<Vec<u32>>>,
    gate: Arc<Semaphore>,
    fetches: AtomicUsize,
    short_by: usize,
}

impl GatedSource {
    fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            items: Arc::new(Mutex::new((1..=n as u32).collect())),
            gate: Arc::new(Semaphore::new(0)),
            fetches: AtomicUsize::new(0),
            short_by: 0,
        })
    }

    fn open(&self) {
        self.gate.add_permits(1);
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl AsyncPagedSource<u32> for GatedSource {
    fn count(&self) -> BoxFuture<'static, Result<usize>> {
        let n = self.items.lock().len();
        async move { Ok(n) }.boxed()
    }

    fn items_at(&self, offset: usize, count: usize) -> BoxFuture<'static, Result<Vec<u32>>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let items = Arc::clone(&self.items);
        let gate = Arc::clone(&self.gate);
        let keep = count.saturating_sub(self.short_by);
        async move {
            let _permit = gate.acquire_owned().await.map_err(Error::provider)?;
            let items = items.lock();
            Ok(items.iter().skip(offset).take(keep).copied().collect())
        }
        .boxed()
    }

    fn placeholder(&self, _index: usize, _page: PageNumber, _offset: usize) -> u32 {
        PLACEHOLDER
    }

    fn index_of(&self, item: &u32) -> BoxFuture<'static, Result<Option<usize>>> {
        let found = self.items.lock().iter().position(|x| x == item);
        async move { Ok(found) }.boxed()
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime")
}

fn inline_ctx(rt: &Runtime) -> Arc<VirtualizationContext> {
    VirtualizationContext::builder()
        .inline_ui()
        .runtime(rt.handle().clone())
        .build()
        .expect("context")
}

fn sync_pager(
    rt: &Runtime,
    source: &Arc<VecSource>,
    config: PagerConfig,
) -> Arc<PaginationManager<u32>> {
    let source: Arc<dyn PagedSource<u32>> = Arc::clone(source) as Arc<dyn PagedSource<u32>>;
    PaginationManager::new(inline_ctx(rt), PageSource::Sync(source), config).expect("pager")
}

fn async_pager(source: &Arc<GatedSource>, config: PagerConfig) -> Arc<PaginationManager<u32>> {
    let ctx = VirtualizationContext::builder()
        .inline_ui()
        .build()
        .expect("context");
    let source: Arc<dyn AsyncPagedSource<u32>> =
        Arc::clone(source) as Arc<dyn AsyncPagedSource<u32>>;
    PaginationManager::new(ctx, PageSource::Async(source), config).expect("pager")
}

fn assert_matches_reference(pager: &PaginationManager<u32>, reference: &[u32]) {
    assert_eq!(pager.count(false).expect("count"), reference.len());
    for (i, want) in reference.iter().enumerate() {
        assert_eq!(pager.get_at(i).expect("get_at"), *want, "index {i}");
    }
}

fn expected_position(
    deltas: &[(PageNumber, i64)],
    base: PageNumber,
    page_size: usize,
    index: usize,
) -> (PageNumber, usize) {
    let capacity = |p: PageNumber| {
        page_size as i64
            + deltas
                .iter()
                .find(|(page, _)| *page == p)
                .map_or(0, |(_, d)| *d)
    };
    let mut page = base;
    let mut remaining = index as i64;
    loop {
        let items = capacity(page);
        if remaining < items {
            return (page, remaining as usize);
        }
        remaining -= items;
        page += 1;
    }
}

#[test]
fn delta_ledger_drops_zero_entries() {
    let mut ledger = DeltaLedger::new();
    assert_eq!(ledger.adjust(3, 2), 2);
    assert_eq!(ledger.adjust(3, -2), 0);
    assert!(ledger.is_empty());

    ledger.adjust(1, -1);
    ledger.adjust(4, 3);
    assert_eq!(ledger.sum_between(0, 4), -1);
    assert_eq!(ledger.sum_between(0, 5), 2);
    assert_eq!(ledger.sum_between(4, 1), 0);
    assert_eq!(ledger.distance(), 4);
    assert_eq!(ledger.page_start(5, 0, 10), 52);
}

#[test]
fn locate_without_deltas_is_nominal() {
    let ledger = DeltaLedger::new();
    assert_eq!(ledger.locate(0, 0, 10, 10), (0, 0));
    assert_eq!(ledger.locate(25, 0, 10, 10), (2, 5));
    assert_eq!(ledger.locate(25, -3, 10, 10), (-1, 5));
}

#[test]
fn locate_skips_short_pages() {
    let mut ledger = DeltaLedger::new();
    ledger.adjust(0, -3);
    // Page 0 holds 7 items, so index 7 is the first item of page 1.
    assert_eq!(ledger.locate(6, 0, 10, 10), (0, 6));
    assert_eq!(ledger.locate(7, 0, 10, 10), (1, 0));
    assert_eq!(ledger.locate(16, 0, 10, 10), (1, 9));
    assert_eq!(ledger.locate(17, 0, 10, 10), (2, 0));
}

#[test]
fn locate_matches_brute_force_layout() {
    let mut rng = Lcg::new(0x5eed_0001);
    for _case in 0..300 {
        let page_size = rng.gen_range_usize(1, 12);
        let base = rng.gen_range_i64(-4, 4);
        let pages = rng.gen_range_usize(1, 12);
        let ps = page_size as i64;

        let mut ledger = DeltaLedger::new();
        let mut deltas = Vec::new();
        for p in base..base + pages as i64 {
            if rng.gen_bool() {
                let d = rng.gen_range_i64(-ps, 2 * ps);
                if d != 0 {
                    ledger.adjust(p, d);
                    deltas.push((p, d));
                }
            }
        }

        let total: i64 = (0..pages as i64 + 3).map(|i| ps + ledger.get(base + i)).sum();
        for index in 0..total.max(0) as usize {
            let want = expected_position(&deltas, base, page_size, index);
            for threshold in [1, 2, 10] {
                assert_eq!(
                    ledger.locate(index, base, page_size, threshold),
                    want,
                    "index {index} ps {page_size} base {base} thr {threshold} deltas {deltas:?}"
                );
            }
        }
    }
}

#[test]
fn page_tracks_replace_needed_through_edits() {
    let mut page: Page<u32> = Page::new(0, 4);
    page.set_placeholders(vec![PLACEHOLDER; 4]);
    assert_eq!(page.get_at(2), Some(PLACEHOLDER));
    assert!(page.is_replace_needed(2));
    assert!(!page.can_reclaim());

    assert!(page.insert_at(0, 9, None, None));
    assert!(page.is_replace_needed(3));
    assert!(!page.is_replace_needed(2));

    assert_eq!(page.remove_at(1, None, None), Some(PLACEHOLDER));
    assert!(page.is_replace_needed(2));

    page.mark_fetched(Instant::now());
    assert!(!page.is_replace_needed(2));
    assert!(page.can_reclaim());
}

#[test]
fn wired_time_comparer_rejects_older_writes() {
    let before = Instant::now();
    let mut page: Page<u32> = Page::new(0, 2);
    page.set_fetched(vec![1, 2], Instant::now());
    let comparer = WiredTimeComparer;

    assert_eq!(page.replace_at(0, 7, Some(before), Some(&comparer)), None);
    assert_eq!(page.peek(0), Some(&1));
    assert_eq!(page.replace_at(0, 7, None, Some(&comparer)), Some(1));
    assert_eq!(
        page.replace_at(1, 8, Some(Instant::now()), Some(&comparer)),
        Some(2)
    );
}

#[test]
fn emitter_unsubscribe() {
    let emitter: EventEmitter<u32> = EventEmitter::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&seen);
    let id = emitter.subscribe(move |v| {
        s.fetch_add(*v as usize, Ordering::SeqCst);
    });
    emitter.emit(&2);
    assert!(emitter.unsubscribe(id));
    assert!(!emitter.unsubscribe(id));
    emitter.emit(&5);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert!(emitter.is_empty());
}

#[test]
fn context_requires_ui_executor() {
    let rt = runtime();
    let err = VirtualizationContext::builder()
        .runtime(rt.handle().clone())
        .build()
        .expect_err("missing executor");
    assert!(matches!(err, Error::UiExecutorMissing));
}

#[test]
fn config_validation() {
    assert!(PagerConfig::default().validate().is_ok());
    assert!(matches!(
        PagerConfig::new(0, 4).validate(),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        PagerConfig::new(4, 0).validate(),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn sync_reads_fetch_each_page_once() {
    let rt = runtime();
    let source = VecSource::new(50);
    let pager = sync_pager(&rt, &source, PagerConfig::new(10, 10));

    for _ in 0..2 {
        for i in 0..50 {
            assert_eq!(pager.get_at(i).expect("get_at"), i as u32 + 1);
        }
    }
    assert_eq!(source.fetches(), 5);
    assert!(matches!(
        pager.get_at(50),
        Err(Error::IndexOutOfRange { index: 50, count: 50 })
    ));
}

#[test]
fn short_sync_page_is_a_contract_error() {
    let rt = runtime();
    let source = Arc::new(VecSource::build(30, 1, false));
    let pager = sync_pager(&rt, &source, PagerConfig::new(10, 10));
    let err = pager.get_at(12).expect_err("short page");
    assert!(matches!(
        err,
        Error::ProviderContract {
            offset: 10,
            expected: 10,
            actual: 9
        }
    ));
    assert_eq!(pager.page_count(), 0);
}

#[test]
fn edits_through_the_cache_keep_indices_stable() {
    let rt = runtime();
    let mut rng = Lcg::new(0xdead_beef);
    for _case in 0..40 {
        let n = rng.gen_range_usize(0, 120);
        let ps = rng.gen_range_usize(1, 9);
        let source = VecSource::new(n);
        let config = PagerConfig::new(ps, 3).with_step_to_jump_threshold(rng.gen_range_usize(1, 4));
        let pager = sync_pager(&rt, &source, config);
        let mut reference: Vec<u32> = source.snapshot();
        let mut next = 10_000u32;

        for _op in 0..80 {
            match rng.gen_range_usize(0, 5) {
                0 | 1 => {
                    let at = rng.gen_range_usize(0, reference.len() + 1);
                    pager.insert(at, next, None).expect("insert");
                    reference.insert(at, next);
                    next += 1;
                }
                2 if !reference.is_empty() => {
                    let at = rng.gen_range_usize(0, reference.len());
                    pager.remove_at(at, None).expect("remove");
                    reference.remove(at);
                }
                3 if !reference.is_empty() => {
                    let at = rng.gen_range_usize(0, reference.len());
                    assert_eq!(pager.get_at(at).expect("get_at"), reference[at]);
                }
                _ => pager.run_claim(""),
            }
        }

        assert_eq!(source.snapshot(), reference);
        assert_matches_reference(&pager, &reference);
    }
}

#[test]
fn eviction_keeps_budget_and_base_page() {
    let rt = runtime();
    let source = VecSource::new(100);
    let pager = sync_pager(&rt, &source, PagerConfig::new(10, 3));
    for i in (0..100).step_by(10) {
        pager.get_at(i).expect("get_at");
    }
    assert_eq!(pager.page_count(), 10);

    pager.run_claim("test");
    let resident: Vec<PageNumber> = pager.snapshot().pages.iter().map(|p| p.number).collect();
    assert_eq!(resident, vec![0, 8, 9]);
}

#[test]
fn base_page_rebalances_after_sustained_prepends() {
    let rt = runtime();
    let source = VecSource::new(8);
    let pager = sync_pager(&rt, &source, PagerConfig::new(4, 10));
    let mut reference = source.snapshot();
    pager.get_at(0).expect("get_at");

    for v in 100..108 {
        pager.insert(0, v, None).expect("insert");
        reference.insert(0, v);
    }
    assert_eq!(pager.base_page(), -1);
    assert_eq!(pager.page_state(-1), Some(FetchState::Fetched));
    assert_matches_reference(&pager, &reference);
}

#[test]
fn emptied_base_page_advances_base() {
    let rt = runtime();
    let source = VecSource::new(12);
    let pager = sync_pager(&rt, &source, PagerConfig::new(4, 10));
    let mut reference = source.snapshot();
    for _ in 0..4 {
        pager.remove_at(0, None).expect("remove");
        reference.remove(0);
    }
    assert_eq!(pager.base_page(), 1);
    assert!(pager.deltas().is_empty());
    assert_matches_reference(&pager, &reference);
}

#[test]
fn delta_budget_overflow_drops_cache() {
    let rt = runtime();
    let source = VecSource::new(100);
    let config = PagerConfig::new(10, 20).with_max_deltas(Some(1));
    let pager = sync_pager(&rt, &source, config);
    let mut reference = source.snapshot();
    pager.get_at(0).expect("get_at");
    pager.get_at(55).expect("get_at");

    pager.insert(3, 500, None).expect("insert");
    reference.insert(3, 500);
    assert_eq!(pager.deltas().len(), 1);

    pager.insert(60, 501, None).expect("insert");
    reference.insert(60, 501);
    assert_eq!(pager.page_count(), 0);
    assert!(pager.deltas().is_empty());
    assert_matches_reference(&pager, &reference);
}

#[test]
fn stale_replace_is_dropped() {
    let rt = runtime();
    let source = VecSource::new(20);
    let ctx = inline_ctx(&rt);
    let dyn_source: Arc<dyn PagedSource<u32>> = Arc::clone(&source) as Arc<dyn PagedSource<u32>>;
    let pager = PaginationManager::builder(ctx, PageSource::Sync(dyn_source))
        .config(PagerConfig::new(10, 10))
        .expiry_comparer(WiredTimeComparer)
        .build()
        .expect("pager");

    let before = Instant::now();
    pager.get_at(0).expect("get_at");
    assert_eq!(pager.replace_at(0, 99, Some(before)).ok().flatten(), None);
    assert_eq!(pager.get_at(0).expect("get_at"), 1);

    assert_eq!(
        pager.replace_at(0, 99, Some(Instant::now())).expect("replace"),
        Some(1)
    );
    assert_eq!(pager.get_at(0).expect("get_at"), 99);
    assert_eq!(source.snapshot()[0], 99);
}

#[test]
fn item_based_edits_fall_back_to_source() {
    let rt = runtime();
    let source = VecSource::new(40);
    let pager = sync_pager(&rt, &source, PagerConfig::new(10, 10));
    pager.get_at(0).expect("get_at");

    assert_eq!(pager.index_of(&5).expect("index_of"), Some(4));
    assert_eq!(pager.index_of(&35).expect("index_of"), Some(34));
    assert!(pager.contains(&40).expect("contains"));
    assert!(!pager.contains(&41).expect("contains"));

    assert_eq!(pager.remove_item(&35, None).expect("remove"), Some(34));
    assert_eq!(pager.replace_item(&2, 77, None).expect("replace"), Some(1));
    assert_eq!(pager.get_at(1).expect("get_at"), 77);
    assert_eq!(pager.count(false).expect("count"), 39);
    assert!(!source.snapshot().contains(&35));
}

#[test]
fn edits_raise_collection_changes() {
    let rt = runtime();
    let source = VecSource::new(10);
    let pager = sync_pager(&rt, &source, PagerConfig::new(5, 10));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    pager.events().collection_changed.subscribe(move |c| {
        let tag = match c {
            CollectionChange::Add { index, .. } => format!("add@{index}"),
            CollectionChange::Remove { index, .. } => format!("remove@{index}"),
            CollectionChange::Replace { index, .. } => format!("replace@{index}"),
            CollectionChange::Move { .. } => "move".to_string(),
            CollectionChange::Reset => "reset".to_string(),
        };
        s.lock().push(tag);
    });

    assert_eq!(pager.append(11, None).expect("append"), Some(10));
    pager.insert(2, 12, None).expect("insert");
    pager.replace_at(0, 13, None).expect("replace");
    assert_eq!(pager.remove_at(2, None).expect("remove"), Some(12));
    assert_eq!(
        *seen.lock(),
        vec!["add@10", "add@2", "replace@0", "remove@2"]
    );
}

#[test]
fn reset_forgets_count_until_next_read() {
    let rt = runtime();
    let source = VecSource::new(30);
    let pager = sync_pager(&rt, &source, PagerConfig::new(10, 10));
    let counts = Arc::new(Mutex::new(Vec::new()));
    let c = Arc::clone(&counts);
    pager
        .events()
        .count_changed
        .subscribe(move |e| c.lock().push(*e));

    pager.get_at(5).expect("get_at");
    pager.on_reset(None);
    assert!(!pager.has_got_count());
    assert_eq!(pager.page_count(), 0);
    assert_eq!(pager.cached_count(), 0);
    assert_eq!(
        *counts.lock(),
        vec![CountChanged {
            count: None,
            needs_reset: true
        }]
    );

    assert_eq!(pager.count(false).expect("count"), 30);
    assert!(pager.has_got_count());

    pager.on_reset(Some(12));
    assert_eq!(pager.count(false).expect("count"), 12);
}

#[test]
fn observable_source_changes_reach_the_cache() {
    let rt = runtime();
    let source = Arc::new(VecSource::build(10, 0, true));
    let pager = sync_pager(&rt, &source, PagerConfig::new(4, 10));
    assert!(pager.is_observable());
    let resets = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&resets);
    pager.events().collection_changed.subscribe(move |c| {
        if c.is_reset() {
            r.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert_eq!(pager.count(false).expect("count"), 10);
    pager.get_at(9).expect("get_at");
    source.push_external(42);
    assert_eq!(pager.count(false).expect("count"), 11);
    assert_eq!(pager.get_at(10).expect("get_at"), 42);
    assert_eq!(source.snapshot().len(), 11);

    source.reset_external();
    assert_eq!(resets.load(Ordering::SeqCst), 1);
    assert!(!pager.has_got_count());
    assert_eq!(pager.count(false).expect("count"), 11);
}

#[test]
fn set_page_size_drops_everything() {
    let rt = runtime();
    let source = VecSource::new(30);
    let pager = sync_pager(&rt, &source, PagerConfig::new(10, 10));
    pager.get_at(15).expect("get_at");
    pager.insert(0, 99, None).expect("insert");
    pager.set_page_size(7).expect("page size");
    assert_eq!(pager.page_count(), 0);
    assert!(pager.deltas().is_empty());
    assert_eq!(pager.calculate_from_index(15), (2, 1));
    assert!(pager.set_page_size(0).is_err());
}

#[test]
fn duplicate_lookups_resolve_to_the_first_occurrence() {
    let rt = runtime();
    let source = VecSource::new(40);
    let pager = sync_pager(&rt, &source, PagerConfig::new(5, 10));
    for i in (0..40).step_by(5) {
        pager.get_at(i).expect("get_at");
    }
    assert_eq!(pager.page_count(), 8);

    pager.insert(1, 38, None).expect("insert");
    assert_eq!(pager.get_at(38).expect("get_at"), 38);
    for _ in 0..16 {
        assert_eq!(pager.index_of(&38).expect("index_of"), Some(1));
    }

    assert_eq!(pager.remove_item(&38, None).expect("remove"), Some(1));
    assert_eq!(pager.index_of(&38).expect("index_of"), Some(37));
    assert_matches_reference(&pager, &source.snapshot());
}

#[test]
fn async_source_served_synchronously() {
    let rt = runtime();
    let gated = GatedSource::new(30);
    gated.open();
    let inner: Arc<dyn AsyncPagedSource<u32>> = Arc::clone(&gated) as Arc<dyn AsyncPagedSource<u32>>;
    let pager = PaginationManager::new(
        inline_ctx(&rt),
        PageSource::from_sync(AsyncAsSync::new(inner)),
        PagerConfig::new(5, 10),
    )
    .expect("pager");

    assert_eq!(pager.count(false).expect("count"), 30);
    assert_eq!(pager.get_at(7).expect("get_at"), 8);
    assert_eq!(pager.page_state(1), Some(FetchState::Fetched));
    assert_eq!(gated.fetches(), 1);
    assert_eq!(pager.index_of(&20).expect("index_of"), Some(19));
    assert!(pager.contains(&30).expect("contains"));
    assert!(!pager.contains(&31).expect("contains"));
}

#[test]
fn reclaim_action_leaves_queue_once_manager_is_gone() {
    let rt = runtime();
    let ctx = inline_ctx(&rt);
    let source = VecSource::new(10);
    let dyn_source: Arc<dyn PagedSource<u32>> = Arc::clone(&source) as Arc<dyn PagedSource<u32>>;
    let pager = PaginationManager::new(
        Arc::clone(&ctx),
        PageSource::Sync(dyn_source),
        PagerConfig::new(5, 1).with_reclaim_interval(Duration::from_secs(3600)),
    )
    .expect("pager");
    assert_eq!(ctx.scheduler().len(), 1);

    ctx.process_actions();
    assert_eq!(ctx.scheduler().len(), 1);

    drop(pager);
    ctx.process_actions();
    assert_eq!(ctx.scheduler().len(), 1, "not due yet");

    let target: std::sync::Weak<dyn ReclaimableService> = std::sync::Weak::<PaginationManager<u32>>::new();
    let orphan = ReclaimPages::new(target, "", Duration::ZERO);
    assert!(!orphan.keep_in_actions_list());
}

#[test]
fn reclaim_action_evicts_through_weak_handle() {
    let rt = runtime();
    let source = VecSource::new(50);
    let pager = sync_pager(&rt, &source, PagerConfig::new(5, 2));
    for i in (0..50).step_by(5) {
        pager.get_at(i).expect("get_at");
    }
    let weak = Arc::downgrade(&pager);
    let weak: std::sync::Weak<dyn ReclaimableService> = weak;
    let action = ReclaimPages::new(weak, "section", Duration::from_secs(60));
    assert!(action.is_due_to_run(Instant::now()));
    assert!(!action.is_due_to_run(Instant::now()));
    action.do_action();
    assert_eq!(pager.page_count(), 2);
    assert!(action.keep_in_actions_list());

    drop(pager);
    assert!(!action.keep_in_actions_list());
}

#[test]
fn one_shot_actions_run_once() {
    let rt = runtime();
    let ctx = inline_ctx(&rt);
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    ctx.add_action(Arc::new(ActionWrapper::on_ui(move || {
        r.fetch_add(1, Ordering::SeqCst);
    })));
    ctx.process_actions();
    ctx.process_actions();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(ctx.scheduler().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ticker_processes_actions_until_context_drops() {
    let ctx = VirtualizationContext::builder()
        .inline_ui()
        .build()
        .expect("context");
    let ran = Arc::new(Semaphore::new(0));
    let r = Arc::clone(&ran);
    ctx.add_action(Arc::new(ActionWrapper::in_background(move || {
        r.add_permits(1);
    })));

    let ticker = ctx.start_ticker(Duration::from_millis(1));
    tokio::time::timeout(Duration::from_secs(5), ran.acquire())
        .await
        .expect("action ran")
        .expect("semaphore open")
        .forget();
    assert!(ctx.scheduler().is_empty());

    drop(ctx);
    tokio::time::timeout(Duration::from_secs(5), ticker)
        .await
        .expect("ticker stopped")
        .expect("ticker task");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_page_is_fetched_once_and_placeholders_replaced() {
    let source = GatedSource::new(20);
    let pager = async_pager(&source, PagerConfig::new(5, 10));
    let replaced = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&replaced);
    pager.events().collection_changed.subscribe(move |c| {
        if let CollectionChange::Replace { old, new, index } = c {
            r.lock().push((*index, *old, *new));
        }
    });

    for i in 0..5 {
        assert_eq!(pager.get_at(i).expect("get_at"), PLACEHOLDER);
    }
    assert_eq!(source.fetches(), 1);
    assert_eq!(pager.page_state(0), Some(FetchState::Placeholders));
    assert_eq!(pager.in_flight(), 1);

    source.open();
    pager.settle().await.expect("settle");

    assert_eq!(pager.page_state(0), Some(FetchState::Fetched));
    assert_eq!(pager.in_flight(), 0);
    let mut seen = replaced.lock().clone();
    seen.sort_unstable();
    assert_eq!(
        seen,
        (0..5)
            .map(|i| (i, Some(PLACEHOLDER), i as u32 + 1))
            .collect::<Vec<_>>()
    );
    assert_eq!(pager.get_at(3).expect("get_at"), 4);
    assert_eq!(source.fetches(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loading_pages_are_never_evicted() {
    let source = GatedSource::new(30);
    let pager = async_pager(&source, PagerConfig::new(5, 1));
    for i in [0, 5, 10, 15] {
        pager.get_at(i).expect("get_at");
    }
    pager.run_claim("");
    assert_eq!(pager.page_count(), 4);

    source.open();
    pager.settle().await.expect("settle");
    pager.run_claim("");
    assert_eq!(pager.page_count(), 1);
    assert_eq!(pager.page_state(0), Some(FetchState::Fetched));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_page_is_wired_again_on_next_read() {
    let source = GatedSource::new(30);
    let pager = async_pager(&source, PagerConfig::new(5, 1));
    assert_eq!(pager.get_at(12).expect("get_at"), PLACEHOLDER);
    assert_eq!(source.fetches(), 1);

    pager.cancel_page_request(2);
    assert_eq!(pager.page_state(2), None);
    assert_eq!(pager.in_flight(), 0);

    source.open();
    pager.settle().await.expect("settle");
    pager.run_claim("");
    assert_eq!(pager.page_count(), 0);

    assert_eq!(pager.get_at(12).expect("get_at"), PLACEHOLDER);
    assert_eq!(source.fetches(), 2);
    pager.settle().await.expect("settle");
    assert_eq!(pager.page_state(2), Some(FetchState::Fetched));
    assert_eq!(pager.get_at(12).expect("get_at"), 13);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_fetch_releases_the_loading_page() {
    let source = Arc::new(GatedSource {
        items: Arc::new(Mutex::new((1..=20).collect())),
        gate: Arc::new(Semaphore::new(0)),
        fetches: AtomicUsize::new(0),
        short_by: 1,
    });
    let pager = async_pager(&source, PagerConfig::new(5, 10));
    pager.get_at(6).expect("get_at");
    source.open();
    assert!(matches!(
        pager.settle().await,
        Err(Error::ProviderContract { .. })
    ));
    assert_eq!(pager.page_state(1), None);
    assert_eq!(pager.in_flight(), 0);

    pager.get_at(6).expect("get_at");
    assert_eq!(source.fetches(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_source_served_asynchronously() {
    let ctx = VirtualizationContext::builder()
        .inline_ui()
        .build()
        .expect("context");
    let source = Arc::new(VecSource::build(10, 0, true));
    let inner: Arc<dyn PagedSource<u32>> = Arc::clone(&source) as Arc<dyn PagedSource<u32>>;
    let pager = PaginationManager::new(
        ctx,
        PageSource::from_async(SyncAsAsync::new(inner, |_, _, _| PLACEHOLDER)),
        PagerConfig::new(4, 10),
    )
    .expect("pager");
    assert!(pager.is_observable());

    let replaced = Arc::new(Mutex::new(Vec::new()));
    let r = Arc::clone(&replaced);
    pager.events().collection_changed.subscribe(move |c| {
        if let CollectionChange::Replace { old, new, index } = c {
            r.lock().push((*index, *old, *new));
        }
    });

    assert_eq!(pager.get_at(9).expect("get_at"), PLACEHOLDER);
    pager.settle().await.expect("settle");
    assert_eq!(pager.get_at(9).expect("get_at"), 10);
    let mut seen = replaced.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![(9, Some(PLACEHOLDER), 10)]);

    source.push_external(42);
    assert_eq!(pager.count(false).expect("count"), 11);
    assert_eq!(pager.get_at(10).expect("get_at"), 42);
    assert_eq!(source.fetches(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_cancels_in_flight_fetch() {
    let source = GatedSource::new(10);
    let pager = async_pager(&source, PagerConfig::new(5, 10));
    let replaced = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&replaced);
    pager.events().collection_changed.subscribe(move |c| {
        if matches!(c, CollectionChange::Replace { .. }) {
            r.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert_eq!(pager.get_at(1).expect("get_at"), PLACEHOLDER);
    pager.on_reset(None);
    assert_eq!(pager.in_flight(), 0);
    assert_eq!(pager.page_count(), 0);

    assert_eq!(pager.get_at(2).expect("get_at"), PLACEHOLDER);
    assert_eq!(source.fetches(), 2);
    source.open();
    pager.settle().await.expect("settle");

    assert_eq!(replaced.load(Ordering::SeqCst), 1);
    assert_eq!(pager.get_at(1).expect("get_at"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_count_raises_count_changed() {
    let source = GatedSource::new(42);
    let pager = async_pager(&source, PagerConfig::new(5, 10));
    let counts = Arc::new(Mutex::new(Vec::new()));
    let c = Arc::clone(&counts);
    pager
        .events()
        .count_changed
        .subscribe(move |e| c.lock().push(*e));

    assert_eq!(pager.count(true).expect("count"), 0);
    assert_eq!(pager.count(true).expect("count"), 0);
    pager.settle().await.expect("settle");

    assert!(pager.has_got_count());
    assert_eq!(pager.count(true).expect("count"), 42);
    assert_eq!(
        *counts.lock(),
        vec![CountChanged {
            count: Some(42),
            needs_reset: true
        }]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn short_async_page_surfaces_from_settle() {
    let source = Arc::new(GatedSource {
        items: Arc::new(Mutex::new((1..=20).collect())),
        gate: Arc::new(Semaphore::new(1)),
        fetches: AtomicUsize::new(0),
        short_by: 2,
    });
    let pager = async_pager(&source, PagerConfig::new(10, 10));
    pager.get_at(0).expect("get_at");
    let err = pager.settle().await.expect_err("contract");
    assert!(matches!(
        err,
        Error::ProviderContract {
            offset: 0,
            expected: 10,
            actual: 8
        }
    ));
    assert_eq!(pager.in_flight(), 0);
    assert_eq!(pager.page_state(0), Some(FetchState::Placeholders));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edits_while_loading_refetch_the_page() {
    let source = GatedSource::new(10);
    let pager = async_pager(&source, PagerConfig::new(5, 10));
    pager.get_at(0).expect("get_at");
    {
        let mut items = source.items.lock();
        items.insert(0, 500);
    }
    pager.insert(0, 500, None).expect("insert");

    source.open();
    pager.settle().await.expect("settle");
    assert_eq!(source.fetches(), 2);
    let got: Vec<u32> = (0..6).map(|i| pager.get_at(i).expect("get_at")).collect();
    assert_eq!(got, vec![500, 1, 2, 3, 4, 5]);
}

#[test]
fn snapshot_reports_cache_shape() {
    let rt = runtime();
    let source = VecSource::new(25);
    let pager = sync_pager(&rt, &source, PagerConfig::new(10, 10));
    pager.get_at(21).expect("get_at");
    pager.insert(0, 99, None).expect("insert");

    let snap = pager.snapshot();
    assert_eq!(snap.count, 26);
    assert!(snap.has_got_count);
    assert_eq!(snap.deltas, vec![PageDelta { page: 0, delta: 1 }]);
    assert_eq!(snap.page(2).map(|p| p.len), Some(5));
    assert_eq!(snap.resident_items(), 5);
    assert!(snap.in_flight.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn random_edits_match_reference(
        n in 0usize..60,
        ps in 1usize..7,
        ops in prop::collection::vec((0u8..4, any::<u16>()), 1..60),
    ) {
        let rt = runtime();
        let source = VecSource::new(n);
        let pager = sync_pager(&rt, &source, PagerConfig::new(ps, 2).with_step_to_jump_threshold(1));
        let mut reference = source.snapshot();
        let mut next = 1_000u32;

        for (kind, seed) in ops {
            let seed = seed as usize;
            match kind {
                0 => {
                    let at = seed % (reference.len() + 1);
                    pager.insert(at, next, None).expect("insert");
                    reference.insert(at, next);
                    next += 1;
                }
                1 if !reference.is_empty() => {
                    let at = seed % reference.len();
                    pager.remove_at(at, None).expect("remove");
                    reference.remove(at);
                }
                2 if !reference.is_empty() => {
                    let at = seed % reference.len();
                    prop_assert_eq!(pager.get_at(at).expect("get_at"), reference[at]);
                }
                _ => pager.run_claim(""),
            }
        }

        prop_assert_eq!(pager.count(false).expect("count"), reference.len());
        for (i, want) in reference.iter().enumerate() {
            prop_assert_eq!(pager.get_at(i).expect("get_at"), *want);
        }
    }
}

#[cfg(feature = "tracing")]
mod tracing_capture {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    /// Collects the target and message of every event.
    struct EventCapture(Arc<Mutex<Vec<(String, String)>>>);

    struct MessageVisitor(String);

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventCapture {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.0
                .lock()
                .push((event.metadata().target().to_string(), visitor.0));
        }
    }

    #[test]
    fn paging_is_logged_under_the_crate_target() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(EventCapture(Arc::clone(&events)));
        let rt = runtime();
        tracing::subscriber::with_default(subscriber, || {
            let source = VecSource::new(30);
            let pager = sync_pager(&rt, &source, PagerConfig::new(5, 1));
            for i in [0, 10, 20] {
                pager.get_at(i).expect("get_at");
            }
            pager.run_claim("");
        });

        let events = events.lock();
        assert!(events.iter().all(|(target, _)| target == "datavirt"));
        assert!(events.iter().any(|(_, m)| m == "PaginationManager: page wired"));
        assert!(events.iter().any(|(_, m)| m == "PaginationManager::run_claim"));
    }
}
