// Example: a model store shown as a virtualizing collection of loading-aware items.
use std::sync::Arc;

use datavirt::{PageNumber, PagerConfig, Result, VirtualizationContext};
use datavirt_collection::{DataSource, ModelStore, Query};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

#[derive(Clone, Debug)]
struct Contact {
    id: u32,
    name: String,
}

struct Contacts {
    rows: Mutex<Vec<Contact>>,
}

impl Contacts {
    fn view(&self, query: &Query<Contact>) -> Vec<Contact> {
        let mut view: Vec<Contact> = self
            .rows
            .lock()
            .iter()
            .filter(|c| query.matches(c))
            .cloned()
            .collect();
        view.sort_by(|a, b| query.compare(a, b));
        view
    }
}

impl ModelStore<Contact> for Contacts {
    fn count(&self, query: &Query<Contact>) -> BoxFuture<'static, Result<usize>> {
        futures::future::ready(Ok(self.view(query).len())).boxed()
    }

    fn models_at(
        &self,
        offset: usize,
        count: usize,
        query: &Query<Contact>,
    ) -> BoxFuture<'static, Result<Vec<Contact>>> {
        let page: Vec<Contact> = self.view(query).into_iter().skip(offset).take(count).collect();
        async move {
            // Pretend to be a remote store.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(page)
        }
        .boxed()
    }

    fn index_of(
        &self,
        model: &Contact,
        query: &Query<Contact>,
    ) -> BoxFuture<'static, Result<Option<usize>>> {
        let found = self.view(query).iter().position(|c| c.id == model.id);
        futures::future::ready(Ok(found)).boxed()
    }

    fn placeholder(&self, _index: usize, _page: PageNumber, _offset: usize) -> Contact {
        Contact {
            id: u32::MAX,
            name: "loading...".to_string(),
        }
    }

    fn create(&self, model: Contact) -> BoxFuture<'static, Result<bool>> {
        self.rows.lock().push(model);
        futures::future::ready(Ok(true)).boxed()
    }

    fn delete(&self, model: &Contact) -> BoxFuture<'static, Result<bool>> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|c| c.id != model.id);
        futures::future::ready(Ok(rows.len() != before)).boxed()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let ctx = VirtualizationContext::builder().inline_ui().build()?;
    let store = Contacts {
        rows: Mutex::new(
            (0..10_000)
                .map(|id| Contact {
                    id,
                    name: format!("contact {id}"),
                })
                .collect(),
        ),
    };
    let source = DataSource::new(ctx, store, PagerConfig::new(50, 4))?;
    source.set_query(
        Query::new().order_by(|a: &Contact, b: &Contact| b.id.cmp(&a.id)),
        false,
    );
    let collection = Arc::clone(source.collection());
    collection.subscribe_count_changed(|e| println!("count changed: {:?}", e.count));

    collection.len()?;
    source.pager().settle().await?;

    let item = collection.get(9_999)?;
    println!("placeholder: loading={} {:?}", item.is_loading(), item.item());
    source.pager().settle().await?;
    println!(
        "filled: loading={} name={}",
        item.is_loading(),
        item.with_item(|c| c.name.clone())
    );

    let created = source
        .create(Contact {
            id: 20_000,
            name: "newest".to_string(),
        })
        .await?;
    if let Some(created) = created {
        println!("created: {}", created.with_item(|c| c.name.clone()));
    }

    source.delete(&item).await?;
    println!("after delete: len={}", collection.len()?);
    Ok(())
}
