//! An in-process backend with the trip planner's tables and procedures.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use chrono::{DateTime, SecondsFormat, SubsecRound, TimeDelta, Utc};
use serde_json::{Value, json};
use slotmap::{SlotMap, new_key_type};

use crate::error::UNIQUE_VIOLATION;
use crate::{
    BlobStore, ChangeEvent, ChangeHandler, ChangeKind, Filter, RealtimeFeed, RemoteDataService,
    RemoteError, Row, RowQuery, Subscription, storage_path_from_url,
};

/// PostgreSQL's `insufficient_privilege`.
const NOT_OWNER: &str = "42501";
/// PL/pgSQL's `no_data_found`.
const NO_DATA: &str = "P0002";
/// PostgreSQL's `invalid_parameter_value`.
const BAD_PARAMETER: &str = "22023";

const LINK_TABLE: &str = "locations_tags";

new_key_type! {
    struct ChannelKey;
}

#[derive(Clone, Debug, PartialEq)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Clone, Default)]
struct Tables {
    rows: BTreeMap<String, Vec<Row>>,
    last_created_at: Option<DateTime<Utc>>,
}

type Channels = Rc<RefCell<SlotMap<ChannelKey, (String, ChangeHandler)>>>;

pub struct MemoryBackend {
    base_url: String,
    bucket: String,
    db: RefCell<Tables>,
    blobs: RefCell<BTreeMap<String, Blob>>,
    channels: Channels,
    realtime_up: Cell<bool>,
    faults: RefCell<Vec<(String, RemoteError)>>,
    calls: RefCell<Vec<String>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_storage("http://localhost:54321", "images")
    }

    pub fn with_storage(base_url: &str, bucket: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            db: RefCell::new(Tables::default()),
            blobs: RefCell::new(BTreeMap::new()),
            channels: Rc::new(RefCell::new(SlotMap::with_key())),
            realtime_up: Cell::new(true),
            faults: RefCell::new(Vec::new()),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Makes the next call of `operation` (`insert:<table>`, `rpc:<procedure>`, `upload`, ...)
    /// fail with `error`.
    pub fn fail_next(&self, operation: &str, error: RemoteError) {
        self.faults
            .borrow_mut()
            .push((operation.to_string(), error));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    /// Inserts rows directly, filling generated columns, without emitting change events.
    pub fn seed(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, RemoteError> {
        let mut db = self.db.borrow().clone();
        let mut discarded = Vec::new();
        let stored = rows
            .into_iter()
            .map(|row| db.insert(table, row, &mut discarded))
            .collect::<Result<Vec<_>, _>>()?;
        *self.db.borrow_mut() = db;
        Ok(stored)
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.db.borrow().table(table).to_vec()
    }

    pub fn blob_paths(&self) -> Vec<String> {
        self.blobs.borrow().keys().cloned().collect()
    }

    pub fn blob(&self, path: &str) -> Option<Blob> {
        self.blobs.borrow().get(path).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.channels.borrow().len()
    }

    /// Drops every realtime channel and refuses new ones, as if the socket went away.
    pub fn disconnect_realtime(&self) {
        self.realtime_up.set(false);
        self.channels.borrow_mut().clear();
        log::warn!("Realtime connection lost");
    }

    pub fn reconnect_realtime(&self) {
        self.realtime_up.set(true);
    }

    pub fn emit(&self, event: &ChangeEvent) {
        let handlers: Vec<ChangeHandler> = self
            .channels
            .borrow()
            .values()
            .filter(|(table, _)| *table == event.table)
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    fn begin(&self, operation: String) -> Result<(), RemoteError> {
        let fault = {
            let mut faults = self.faults.borrow_mut();
            faults
                .iter()
                .position(|(name, _)| *name == operation)
                .map(|index| faults.remove(index).1)
        };
        self.calls.borrow_mut().push(operation);
        match fault {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Runs `write` against a copy of the tables and commits it only if it succeeds.
    fn transact<R>(
        &self,
        write: impl FnOnce(&mut Tables, &mut Vec<ChangeEvent>) -> Result<R, RemoteError>,
    ) -> Result<R, RemoteError> {
        let mut db = self.db.borrow().clone();
        let mut events = Vec::new();
        let result = write(&mut db, &mut events)?;
        *self.db.borrow_mut() = db;
        for event in &events {
            self.emit(event);
        }
        Ok(result)
    }
}

impl RemoteDataService for MemoryBackend {
    async fn select(&self, query: RowQuery) -> Result<Vec<Row>, RemoteError> {
        self.begin(format!("select:{}", query.table))?;
        Ok(query.run(self.db.borrow().table(&query.table)))
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, RemoteError> {
        self.begin(format!("insert:{table}"))?;
        self.transact(|db, events| {
            rows.into_iter()
                .map(|row| db.insert(table, row, events))
                .collect()
        })
    }

    async fn upsert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, RemoteError> {
        self.begin(format!("upsert:{table}"))?;
        self.transact(|db, events| {
            rows.into_iter()
                .map(|row| db.upsert(table, row, events))
                .collect()
        })
    }

    async fn update(
        &self,
        table: &str,
        patch: Row,
        filters: Vec<Filter>,
    ) -> Result<Vec<Row>, RemoteError> {
        self.begin(format!("update:{table}"))?;
        self.transact(|db, events| db.update(table, &patch, &filters, events))
    }

    async fn delete(&self, table: &str, filters: Vec<Filter>) -> Result<Vec<Row>, RemoteError> {
        self.begin(format!("delete:{table}"))?;
        self.transact(|db, events| Ok(db.delete(table, &filters, events)))
    }

    async fn rpc(&self, name: &str, params: Value) -> Result<Value, RemoteError> {
        self.begin(format!("rpc:{name}"))?;
        let params = Params(params);
        self.transact(|db, events| match name {
            "add_direction" => db.add_direction(&params, events),
            "update_direction" => db.update_direction(&params, events),
            "delete_direction" => db.delete_direction(&params, events),
            "create_location_with_tags" => db.create_location(&params, events),
            "update_location_with_tags" => db.update_location(&params, events),
            "delete_location" => db.delete_location(&params, events),
            other => Err(RemoteError::http(
                404,
                "PGRST202",
                format!("Could not find the function public.{other}"),
            )),
        })
    }
}

impl BlobStore for MemoryBackend {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), RemoteError> {
        self.begin("upload".to_string())?;
        let mut blobs = self.blobs.borrow_mut();
        if blobs.contains_key(path) {
            return Err(RemoteError::http(409, "Duplicate", "The resource already exists"));
        }
        blobs.insert(
            path.to_string(),
            Blob {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{path}",
            self.base_url, self.bucket
        )
    }

    fn path_from_public_url(&self, url: &str) -> Option<String> {
        storage_path_from_url(url, &self.bucket)
    }

    async fn remove(&self, paths: Vec<String>) -> Result<(), RemoteError> {
        self.begin("remove".to_string())?;
        let mut blobs = self.blobs.borrow_mut();
        for path in paths {
            if blobs.remove(&path).is_none() {
                log::debug!("Blob {path} was already gone");
            }
        }
        Ok(())
    }
}

impl RealtimeFeed for MemoryBackend {
    fn subscribe(&self, table: &str, handler: ChangeHandler) -> Result<Subscription, RemoteError> {
        self.begin(format!("subscribe:{table}"))?;
        if !self.realtime_up.get() {
            return Err(RemoteError::Realtime("channel is closed".to_string()));
        }
        let key = self
            .channels
            .borrow_mut()
            .insert((table.to_string(), handler));
        let channels = Rc::downgrade(&self.channels);
        Ok(Subscription::new(move || {
            if let Some(channels) = channels.upgrade() {
                channels.borrow_mut().remove(key);
            }
        }))
    }
}

fn unique_keys(table: &str) -> &'static [&'static [&'static str]] {
    match table {
        "tags" => &[&["id"], &["name"]],
        "favourites" => &[&["id"], &["user_id", "location_id"]],
        LINK_TABLE => &[&["location_id", "tag_id"]],
        _ => &[&["id"]],
    }
}

fn change(table: &str, kind: ChangeKind, new: Option<Row>, old: Option<Row>) -> ChangeEvent {
    ChangeEvent {
        table: table.to_string(),
        kind,
        new,
        old,
    }
}

fn str_field<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}

impl Tables {
    fn table(&self, name: &str) -> &[Row] {
        self.rows.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    fn stamp(&mut self) -> String {
        let now = Utc::now().trunc_subsecs(6);
        let next = match self.last_created_at {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        self.last_created_at = Some(next);
        next.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn fill_generated(&mut self, table: &str, row: &mut Row) {
        if table == LINK_TABLE {
            return;
        }
        if row.get("id").is_none_or(Value::is_null) {
            row.insert("id".into(), uuid::Uuid::new_v4().to_string().into());
        }
        if row.get("created_at").is_none_or(Value::is_null) {
            let stamp = self.stamp();
            row.insert("created_at".into(), stamp.into());
        }
    }

    fn find_conflict(
        &self,
        table: &str,
        candidate: &Row,
        skip: Option<usize>,
    ) -> Option<(usize, String)> {
        for columns in unique_keys(table) {
            let Some(key) = columns
                .iter()
                .map(|column| candidate.get(*column).filter(|value| !value.is_null()))
                .collect::<Option<Vec<&Value>>>()
            else {
                continue;
            };
            let clash = self.table(table).iter().enumerate().find(|(index, row)| {
                Some(*index) != skip
                    && columns
                        .iter()
                        .zip(&key)
                        .all(|(column, value)| row.get(*column) == Some(*value))
            });
            if let Some((index, _)) = clash {
                return Some((index, format!("{table}_{}_key", columns.join("_"))));
            }
        }
        None
    }

    fn insert(
        &mut self,
        table: &str,
        mut row: Row,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<Row, RemoteError> {
        self.fill_generated(table, &mut row);
        if let Some((_, constraint)) = self.find_conflict(table, &row, None) {
            return Err(unique_violation(&constraint));
        }
        self.rows
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        events.push(change(table, ChangeKind::Insert, Some(row.clone()), None));
        Ok(row)
    }

    fn upsert(
        &mut self,
        table: &str,
        row: Row,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<Row, RemoteError> {
        let Some((index, _)) = self.find_conflict(table, &row, None) else {
            return self.insert(table, row, events);
        };
        let rows = self.rows.entry(table.to_string()).or_default();
        let old = rows[index].clone();
        let mut merged = old.clone();
        merged.extend(row);
        rows[index] = merged.clone();
        events.push(change(table, ChangeKind::Update, Some(merged.clone()), Some(old)));
        Ok(merged)
    }

    fn update(
        &mut self,
        table: &str,
        patch: &Row,
        filters: &[Filter],
        events: &mut Vec<ChangeEvent>,
    ) -> Result<Vec<Row>, RemoteError> {
        let targets: Vec<usize> = self
            .table(table)
            .iter()
            .enumerate()
            .filter(|(_, row)| filters.iter().all(|filter| filter.matches(row)))
            .map(|(index, _)| index)
            .collect();

        let mut updated = Vec::with_capacity(targets.len());
        for index in targets {
            let old = self.table(table)[index].clone();
            let mut next = old.clone();
            next.extend(patch.clone());
            if let Some((_, constraint)) = self.find_conflict(table, &next, Some(index)) {
                return Err(unique_violation(&constraint));
            }
            self.rows.entry(table.to_string()).or_default()[index] = next.clone();
            events.push(change(table, ChangeKind::Update, Some(next.clone()), Some(old)));
            updated.push(next);
        }
        Ok(updated)
    }

    fn delete(&mut self, table: &str, filters: &[Filter], events: &mut Vec<ChangeEvent>) -> Vec<Row> {
        let Some(rows) = self.rows.get_mut(table) else {
            return Vec::new();
        };
        let (removed, kept): (Vec<Row>, Vec<Row>) = std::mem::take(rows)
            .into_iter()
            .partition(|row| filters.iter().all(|filter| filter.matches(row)));
        *rows = kept;
        for row in &removed {
            events.push(change(table, ChangeKind::Delete, None, Some(row.clone())));
        }
        removed
    }

    fn find(&self, table: &str, id: &str) -> Option<Row> {
        self.table(table)
            .iter()
            .find(|row| str_field(row, "id") == Some(id))
            .cloned()
    }

    /// The row `id` of `table`, provided `user` owns it.
    fn owned(&self, table: &str, id: &str, user: &str) -> Result<Row, RemoteError> {
        let row = self
            .find(table, id)
            .ok_or_else(|| RemoteError::http(404, NO_DATA, format!("{table} {id} not found")))?;
        if str_field(&row, "user_id") != Some(user) {
            return Err(RemoteError::http(
                403,
                NOT_OWNER,
                format!("{user} does not own {table} {id}"),
            ));
        }
        Ok(row)
    }

    fn tag_names(&self, location_id: &str) -> Vec<String> {
        self.table(LINK_TABLE)
            .iter()
            .filter(|link| str_field(link, "location_id") == Some(location_id))
            .filter_map(|link| str_field(link, "tag_id"))
            .filter_map(|tag_id| self.find("tags", tag_id))
            .filter_map(|tag| str_field(&tag, "name").map(str::to_string))
            .collect()
    }

    fn set_location_tags(
        &mut self,
        location_id: &str,
        names: &[String],
        events: &mut Vec<ChangeEvent>,
    ) -> Result<(), RemoteError> {
        self.delete(
            LINK_TABLE,
            &[Filter::eq("location_id", location_id)],
            events,
        );
        for name in names {
            let existing = self
                .table("tags")
                .iter()
                .find(|tag| str_field(tag, "name") == Some(name.as_str()))
                .and_then(|tag| str_field(tag, "id"))
                .map(str::to_string);
            let tag_id = match existing {
                Some(id) => id,
                None => {
                    let tag = self.insert("tags", row(json!({ "name": name })), events)?;
                    str_field(&tag, "id").unwrap_or_default().to_string()
                }
            };
            self.insert(
                LINK_TABLE,
                row(json!({ "location_id": location_id, "tag_id": tag_id })),
                events,
            )?;
        }
        Ok(())
    }

    fn with_tags(&self, mut location: Row) -> Value {
        let id = str_field(&location, "id").unwrap_or_default().to_string();
        location.insert("tags".into(), json!(self.tag_names(&id)));
        Value::Object(location)
    }

    fn add_direction(
        &mut self,
        params: &Params,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<Value, RemoteError> {
        let direction = row(json!({
            "user_id": params.required("p_user_id")?,
            "title": params.required("p_title")?,
            "country": params.required("p_country")?,
            "city": params.value("p_city"),
            "cover_url": params.value("p_cover_url"),
        }));
        self.insert("directions", direction, events).map(Value::Object)
    }

    fn update_direction(
        &mut self,
        params: &Params,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<Value, RemoteError> {
        let id = params.required("p_direction_id")?;
        self.owned("directions", &id, &params.required("p_user_id")?)?;

        let mut patch = row(json!({
            "title": params.required("p_title")?,
            "country": params.required("p_country")?,
            "city": params.value("p_city"),
        }));
        if let Some(cover_url) = params.optional("p_cover_url") {
            patch.insert("cover_url".into(), cover_url.into());
        }
        let mut updated = self.update("directions", &patch, &[Filter::eq("id", id.as_str())], events)?;
        Ok(updated.pop().map(Value::Object).unwrap_or(Value::Null))
    }

    fn delete_direction(
        &mut self,
        params: &Params,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<Value, RemoteError> {
        let id = params.required("p_direction_id")?;
        let direction = self.owned("directions", &id, &params.required("p_user_id")?)?;

        let location_ids: Vec<Value> = self
            .table("locations")
            .iter()
            .filter(|location| str_field(location, "direction_id") == Some(id.as_str()))
            .filter_map(|location| location.get("id").cloned())
            .collect();
        if !location_ids.is_empty() {
            let in_direction = Filter::one_of("location_id", location_ids);
            self.delete("favourites", std::slice::from_ref(&in_direction), events);
            self.delete(LINK_TABLE, &[in_direction], events);
        }
        self.delete("locations", &[Filter::eq("direction_id", id.as_str())], events);
        self.delete("directions", &[Filter::eq("id", id.as_str())], events);
        Ok(Value::Object(direction))
    }

    fn create_location(
        &mut self,
        params: &Params,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<Value, RemoteError> {
        let direction_id = params.required("p_direction_id")?;
        if self.find("directions", &direction_id).is_none() {
            return Err(RemoteError::http(
                404,
                NO_DATA,
                format!("directions {direction_id} not found"),
            ));
        }
        let location = row(json!({
            "user_id": params.required("p_user_id")?,
            "direction_id": direction_id,
            "title": params.required("p_title")?,
            "description": params.value("p_description"),
            "address": params.value("p_address"),
            "cost": params.value("p_cost"),
            "source_url": params.value("p_source_url"),
            "image_url": params.value("p_image_url"),
        }));
        let location = self.insert("locations", location, events)?;
        let id = str_field(&location, "id").unwrap_or_default().to_string();
        self.set_location_tags(&id, &params.tags(), events)?;
        Ok(self.with_tags(location))
    }

    fn update_location(
        &mut self,
        params: &Params,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<Value, RemoteError> {
        let id = params.required("p_loc_id")?;
        self.owned("locations", &id, &params.required("p_user_id")?)?;

        let mut patch = row(json!({
            "title": params.required("p_title")?,
            "description": params.value("p_description"),
            "address": params.value("p_address"),
            "cost": params.value("p_cost"),
            "source_url": params.value("p_source_url"),
        }));
        if let Some(image_url) = params.optional("p_image_url") {
            patch.insert("image_url".into(), image_url.into());
        }
        let mut updated = self.update("locations", &patch, &[Filter::eq("id", id.as_str())], events)?;
        self.set_location_tags(&id, &params.tags(), events)?;
        match updated.pop() {
            Some(location) => Ok(self.with_tags(location)),
            None => Ok(Value::Null),
        }
    }

    fn delete_location(
        &mut self,
        params: &Params,
        events: &mut Vec<ChangeEvent>,
    ) -> Result<Value, RemoteError> {
        let id = params.required("p_location_id")?;
        let location = self.owned("locations", &id, &params.required("p_user_id")?)?;
        self.delete(LINK_TABLE, &[Filter::eq("location_id", id.as_str())], events);
        self.delete("locations", &[Filter::eq("id", id.as_str())], events);
        Ok(Value::Object(location))
    }
}

struct Params(Value);

impl Params {
    fn value(&self, name: &str) -> Value {
        self.0.get(name).cloned().unwrap_or(Value::Null)
    }

    fn optional(&self, name: &str) -> Option<String> {
        self.0
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn required(&self, name: &str) -> Result<String, RemoteError> {
        self.optional(name)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| RemoteError::http(400, BAD_PARAMETER, format!("{name} is required")))
    }

    fn tags(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let requested = self.0.get("p_tags").and_then(Value::as_array);
        for name in requested.into_iter().flatten().filter_map(Value::as_str) {
            let name = name.trim();
            if !name.is_empty() && !names.iter().any(|seen| seen == name) {
                names.push(name.to_string());
            }
        }
        names
    }
}

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn unique_violation(constraint: &str) -> RemoteError {
    RemoteError::http(
        409,
        UNIQUE_VIOLATION,
        format!("duplicate key value violates unique constraint \"{constraint}\""),
    )
}
