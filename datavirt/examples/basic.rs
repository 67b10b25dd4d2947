// Example: a synchronous source paged through the cache, with an edit and eviction.
use std::sync::Arc;

use datavirt::{
    Error, FnPagedSource, PageSource, PagerConfig, PaginationManager, Result,
    VirtualizationContext,
};

fn main() -> Result<()> {
    let rt = tokio::runtime::Runtime::new().map_err(Error::provider)?;
    let ctx = VirtualizationContext::builder()
        .inline_ui()
        .runtime(rt.handle().clone())
        .build()?;

    let data: Arc<Vec<u64>> = Arc::new((0..1_000_000).collect());
    let count_data = Arc::clone(&data);
    let source = FnPagedSource::new(
        move || Ok(count_data.len()),
        move |offset, count| Ok(data.iter().skip(offset).take(count).copied().collect()),
    );
    let pager = PaginationManager::new(ctx, PageSource::from_sync(source), PagerConfig::new(100, 4))?;

    println!("count={}", pager.count(false)?);
    for index in [0, 150, 999_999, 500_000, 250] {
        println!("item[{index}]={}", pager.get_at(index)?);
    }

    pager.insert(150, 42, None)?;
    println!(
        "after insert: item[150]={} item[151]={} count={}",
        pager.get_at(150)?,
        pager.get_at(151)?,
        pager.cached_count()
    );

    pager.run_claim("basic");
    println!("{:#?}", pager.snapshot());
    Ok(())
}
