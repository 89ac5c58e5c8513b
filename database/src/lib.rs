use core::ops::Range;
use std::{
    borrow::Cow,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use bytesize::ByteSize;
use im::OrdMap;
use itertools::Either;
use libmdbx::{
    Database as MdbxDatabase, DatabaseFlags, Environment, Geometry, Transaction, WriteFlags, RW,
};
use log::info;
use snap::raw::{Decoder, Encoder};
use tap::Pipe as _;
use thiserror::Error;
use unwrap_none::UnwrapNone as _;

const GROWTH_STEP: ByteSize = ByteSize::mib(256);
const MAX_NAMED_DATABASES: usize = 10;

/// Ordered byte-keyed storage backed either by `libmdbx` or by an in-memory map.
///
/// Keys are compared lexicographically. Values are compressed with `snap`.
pub struct Database(DatabaseKind);

impl Database {
    pub fn persistent(name: &str, directory: impl AsRef<Path>, max_size: ByteSize) -> Result<Self> {
        let directory = directory.as_ref();

        // Checked up front so that the error names the real problem.
        directory.to_str().ok_or(Error)?;

        fs_err::create_dir_all(directory)?;

        let environment = Environment::builder()
            .set_max_dbs(MAX_NAMED_DATABASES)
            .set_geometry(Geometry {
                size: Some(..usize::try_from(max_size.as_u64())?),
                growth_step: Some(isize::try_from(GROWTH_STEP.as_u64())?),
                shrink_threshold: None,
                page_size: None,
            })
            .open(directory)?;

        let transaction = environment.begin_rw_txn()?;
        transaction.create_db(Some(name), DatabaseFlags::default())?;
        transaction.commit()?;

        info!("opened database {name} in {}", directory.display());

        Ok(Self(DatabaseKind::Persistent {
            database_name: name.to_owned(),
            environment,
        }))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self(DatabaseKind::InMemory {
            map: Mutex::default(),
        })
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                transaction
                    .get::<Cow<_>>(database.dbi(), key.as_ref())?
                    .map(|compressed| decompress(&compressed))
            }
            DatabaseKind::InMemory { map } => map
                .lock()
                .expect("in-memory database mutex is poisoned")
                .get(key.as_ref())
                .map(|compressed| decompress(compressed)),
        }
        .transpose()
    }

    pub fn put(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        self.put_batch(core::iter::once((key, value)))
    }

    /// Writes all pairs in a single transaction.
    pub fn put_batch(
        &self,
        pairs: impl IntoIterator<Item = (impl AsRef<[u8]>, impl AsRef<[u8]>)>,
    ) -> Result<()> {
        self.write(None::<Range<&[u8]>>, pairs)
    }

    /// Deletes all keys in the half-open range `start..end`.
    pub fn delete_range(&self, range: Range<impl AsRef<[u8]>>) -> Result<()> {
        self.write(Some(range), core::iter::empty::<(&[u8], &[u8])>())
    }

    /// Deletes all keys in `range` and writes `pairs` in a single transaction.
    ///
    /// Readers observe either the old contents of the range or the new ones in full.
    pub fn replace_range(
        &self,
        range: Range<impl AsRef<[u8]>>,
        pairs: impl IntoIterator<Item = (impl AsRef<[u8]>, impl AsRef<[u8]>)>,
    ) -> Result<()> {
        self.write(Some(range), pairs)
    }

    /// Returns all pairs with keys in the half-open range `start..end` in ascending key order.
    #[expect(clippy::type_complexity)]
    pub fn iterator_range(
        &self,
        range: Range<impl AsRef<[u8]>>,
    ) -> Result<impl Iterator<Item = Result<(Cow<[u8]>, Vec<u8>)>>> {
        let start = range.start.as_ref();
        let end = range.end.as_ref().to_vec();

        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;

                cursor
                    .set_range::<Cow<_>, _>(start)
                    .transpose()
                    .into_iter()
                    .chain(core::iter::from_fn(move || cursor.next().transpose()))
                    .take_while(move |result| match result {
                        Ok((key, _)) => **key < *end,
                        Err(_) => true,
                    })
                    .map(|result| decompress_pair(result?))
                    .pipe(Either::Left)
            }
            DatabaseKind::InMemory { map } => {
                let map = map.lock().expect("in-memory database mutex is poisoned");
                let within_range = split_range(&map, start, &end);

                within_range
                    .into_iter()
                    .map(|(key, value)| Ok((Cow::Owned(key.to_vec()), decompress(value.as_ref())?)))
                    .pipe(Either::Right)
            }
        }
        .pipe(Ok)
    }

    /// Returns the first key-value pair whose key is greater than or equal to `key`.
    ///
    /// Behaves like [`im::OrdMap::get_next`].
    ///
    /// [`im::OrdMap::get_next`]: https://docs.rs/im/15.1.0/im/ordmap/struct.OrdMap.html#method.get_next
    pub fn next(&self, key: impl AsRef<[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_ro_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                let mut cursor = transaction.cursor(&database)?;

                cursor.set_range(key.as_ref())?.map(decompress_pair)
            }
            DatabaseKind::InMemory { map } => map
                .lock()
                .expect("in-memory database mutex is poisoned")
                .get_next(key.as_ref())
                .map(|(key, value)| Ok((key.to_vec(), decompress(value)?))),
        }
        .transpose()
    }

    fn write(
        &self,
        range_to_delete: Option<Range<impl AsRef<[u8]>>>,
        pairs: impl IntoIterator<Item = (impl AsRef<[u8]>, impl AsRef<[u8]>)>,
    ) -> Result<()> {
        match self.kind() {
            DatabaseKind::Persistent {
                database_name,
                environment,
            } => {
                let transaction = environment.begin_rw_txn()?;
                let database = transaction.open_db(Some(database_name))?;

                if let Some(range) = range_to_delete {
                    delete_range_in_transaction(&transaction, &database, range)?;
                }

                for (key, value) in pairs {
                    let key = key.as_ref();
                    let compressed = compress(value.as_ref())?;
                    transaction.put(database.dbi(), key, compressed, WriteFlags::default())?;
                }

                transaction.commit()?;
            }
            DatabaseKind::InMemory { map } => {
                // Mutate a copy and swap it in so that a failed compression leaves the map intact.
                let mut map = map.lock().expect("in-memory database mutex is poisoned");
                let mut new_map = map.clone();

                if let Some(range) = range_to_delete {
                    new_map = without_range(&new_map, range.start.as_ref(), range.end.as_ref());
                }

                for (key, value) in pairs {
                    let key = key.as_ref().into();
                    let compressed = compress(value.as_ref())?.into();
                    new_map.insert(key, compressed);
                }

                *map = new_map;
            }
        }

        Ok(())
    }

    const fn kind(&self) -> &DatabaseKind {
        &self.0
    }
}

enum DatabaseKind {
    Persistent {
        database_name: String,
        environment: Environment,
    },
    InMemory {
        // `OrdMap` clones its elements when splitting and copying.
        // `Arc<[u8]>` keeps that cheap.
        map: Mutex<InMemoryMap>,
    },
}

#[derive(Debug, Error)]
#[error("database directory path should be a valid Unicode string")]
struct Error;

type InMemoryMap = OrdMap<Arc<[u8]>, Arc<[u8]>>;

fn delete_range_in_transaction(
    transaction: &Transaction<RW>,
    database: &MdbxDatabase,
    range: Range<impl AsRef<[u8]>>,
) -> Result<()> {
    let start = range.start.as_ref();
    let end = range.end.as_ref();

    let mut cursor = transaction.cursor(database)?;

    let Some((mut key, ())) = cursor.set_range::<Cow<_>, _>(start)? else {
        return Ok(());
    };

    while *key < *end {
        cursor.del(WriteFlags::default())?;
        match cursor.next::<Cow<_>, _>()? {
            Some((new_key, ())) => key = new_key,
            None => break,
        }
    }

    Ok(())
}

// `OrdMap::split` drops the key it splits on, so boundary pairs are put back by hand.
fn split_range(map: &InMemoryMap, start: &[u8], end: &[u8]) -> InMemoryMap {
    if start >= end {
        return InMemoryMap::new();
    }

    let start_pair = map.get_key_value(start);
    let (_, mut above) = map.split(start);

    if let Some((key, value)) = start_pair {
        above
            .insert(Arc::clone(key), Arc::clone(value))
            .expect_none("start_pair should have been discarded by OrdMap::split");
    }

    let (within_range, _) = above.split(end);

    within_range
}

fn without_range(map: &InMemoryMap, start: &[u8], end: &[u8]) -> InMemoryMap {
    if start >= end {
        return map.clone();
    }

    let end_pair = map.get_key_value(end);
    let (below, _) = map.split(start);
    let (_, above) = map.split(end);

    let mut remaining = below.union(above);

    if let Some((key, value)) = end_pair {
        remaining
            .insert(Arc::clone(key), Arc::clone(value))
            .expect_none("end_pair should have been discarded by OrdMap::split");
    }

    remaining
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    Encoder::new().compress_vec(data).map_err(Into::into)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    Decoder::new().decompress_vec(data).map_err(Into::into)
}

fn decompress_pair<K>((key, compressed_value): (K, Cow<[u8]>)) -> Result<(K, Vec<u8>)> {
    let value = decompress(&compressed_value)?;
    Ok((key, value))
}
