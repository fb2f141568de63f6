//! The query algebra.
//!
//! A [`Query`] is an immutable builder whose *type* encodes which
//! operations are legal to call next: each chain state is a phantom marker
//! type, so an illegal successor simply has no method to call, rather than
//! being checked at runtime. The one exception is
//! [`QueryError::DuplicateJoin`], which depends on the set of fields
//! already joined and so cannot be encoded as a distinct type without one
//! type per subset of joined fields; it is checked at `join()` call time.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::database::Database;
use crate::driver::Statement;
use crate::error::{Error, QueryError, SqlGenError};
use crate::expr::Expression;
use crate::record::Record;
use crate::schema::{PrimitiveType, TableSchema};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub(crate) enum JoinKind {
    Standard { parent_key: &'static str, child_key: &'static str },
    Pivot {
        pivot_table: &'static str,
        pivot_parent_key: &'static str,
        pivot_child_key: &'static str,
        parent_key: &'static str,
        child_key: &'static str,
    },
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Ordering {
    pub entries: Vec<(&'static str, OrderDirection)>,
}

pub(crate) struct JoinNode {
    pub field: &'static str,
    pub schema: Arc<TableSchema>,
    pub kind: JoinKind,
    pub order: Ordering,
    pub limit: Option<(u64, u64)>,
    pub loader: Box<dyn ChildLoader>,
}

impl std::fmt::Debug for JoinNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinNode")
            .field("field", &self.field)
            .field("schema", &self.schema.type_name)
            .field("kind", &self.kind)
            .field("order", &self.order)
            .field("limit", &self.limit)
            .finish()
    }
}

impl Clone for JoinNode {
    fn clone(&self) -> Self {
        JoinNode {
            field: self.field,
            schema: Arc::clone(&self.schema),
            kind: self.kind.clone(),
            order: self.order.clone(),
            limit: self.limit,
            loader: self.loader.clone_boxed(),
        }
    }
}

/// Decodes and regroups child rows for one join, type-erased so
/// [`QueryNode`] can hold any number of joins with distinct element types
/// without a type parameter per join. Constructed once, inside
/// `do_join::<C>`, where `C` is still in scope.
pub(crate) trait ChildLoader: Send + Sync {
    /// Decodes every remaining row of `stmt`, pairing each with the
    /// correlation value read from `key_index` (the child's own foreign key
    /// for a standard join, or the appended pivot-parent column for a pivot
    /// join).
    fn decode_rows(
        &self,
        stmt: &mut dyn Statement,
        schema: &TableSchema,
        key_index: usize,
        key_primitive: PrimitiveType,
    ) -> Result<Vec<(Value, Box<dyn Any>)>, Error>;

    /// Collects one parent's group of boxed records back into a `Vec<C>`,
    /// erased as `Box<dyn Any>` for [`Record::set_child_collection`].
    fn collect(&self, items: Vec<Box<dyn Any>>) -> Box<dyn Any>;

    /// The decoded column values of one boxed child, used to recognize the
    /// same child reached through more than one pivot row.
    fn row_identity(&self, item: &dyn Any, schema: &TableSchema) -> Vec<Value>;

    fn clone_boxed(&self) -> Box<dyn ChildLoader>;
}

pub(crate) struct TypedChildLoader<C>(PhantomData<fn() -> C>);

impl<C> TypedChildLoader<C> {
    pub(crate) fn new() -> Self {
        TypedChildLoader(PhantomData)
    }
}

impl<C: Record> ChildLoader for TypedChildLoader<C> {
    fn decode_rows(
        &self,
        stmt: &mut dyn Statement,
        schema: &TableSchema,
        key_index: usize,
        key_primitive: PrimitiveType,
    ) -> Result<Vec<(Value, Box<dyn Any>)>, Error> {
        let mut out = Vec::new();
        while stmt.step()? {
            let row = stmt.row();
            let key = row.read_column(key_index, key_primitive)?;
            let record = C::decode_row(row, schema)?;
            out.push((key, Box::new(record) as Box<dyn Any>));
        }
        Ok(out)
    }

    fn collect(&self, items: Vec<Box<dyn Any>>) -> Box<dyn Any> {
        let typed: Vec<C> = items
            .into_iter()
            .map(|b| *b.downcast::<C>().expect("child loader type mismatch"))
            .collect();
        Box::new(typed)
    }

    fn row_identity(&self, item: &dyn Any, schema: &TableSchema) -> Vec<Value> {
        let record = item.downcast_ref::<C>().expect("child loader type mismatch");
        record.column_values(schema)
    }

    fn clone_boxed(&self) -> Box<dyn ChildLoader> {
        Box::new(TypedChildLoader::<C>::new())
    }
}

/// The runtime half of the query algebra: the actual tree the phantom-typed
/// [`Query`] wrapper accumulates.
#[derive(Debug, Clone)]
pub struct QueryNode {
    pub(crate) schema: Arc<TableSchema>,
    pub(crate) joins: Vec<JoinNode>,
    pub(crate) focus: Option<usize>,
    pub(crate) root_order: Ordering,
    pub(crate) root_limit: Option<(u64, u64)>,
    pub(crate) predicate: Option<Expression>,
}

impl QueryNode {
    fn new(schema: Arc<TableSchema>) -> Self {
        QueryNode {
            schema,
            joins: Vec::new(),
            focus: None,
            root_order: Ordering::default(),
            root_limit: None,
            predicate: None,
        }
    }

    /// Checks every column reference in `expr` against the chain's cached
    /// schemas, so a predicate over a form or field that is not reachable
    /// here fails at `where()` time, before any statement is prepared.
    fn validate_expression(&self, expr: &Expression) -> Result<(), SqlGenError> {
        for (form, field) in expr.column_refs() {
            let schema = if form == self.schema.type_name {
                &self.schema
            } else if let Some(join) = self.joins.iter().find(|j| j.schema.type_name == form) {
                &join.schema
            } else {
                return Err(SqlGenError::UnresolvedForm { form, column: field });
            };
            if schema.column(field).is_none() {
                return Err(SqlGenError::UnknownColumn { form, column: field });
            }
        }
        Ok(())
    }

    fn push_order(&mut self, field: &'static str, dir: OrderDirection) {
        match self.focus {
            None => self.root_order.entries.push((field, dir)),
            Some(idx) => self.joins[idx].order.entries.push((field, dir)),
        }
    }

    fn set_limit(&mut self, limit: u64, skip: u64) {
        match self.focus {
            None => self.root_limit = Some((limit, skip)),
            Some(idx) => self.joins[idx].limit = Some((limit, skip)),
        }
    }
}

// ---------------------------------------------------------------------
// Phantom chain states
// ---------------------------------------------------------------------

pub struct TableState;
pub struct Join<const JOINED: bool>;
pub struct Order<const JOINED: bool>;
pub struct Limit<const JOINED: bool>;
pub struct Where<const JOINED: bool>;

/// An immutable, partially built query. `T` is the OverAllForm; `S` is the
/// phantom chain state gating which methods are callable next.
pub struct Query<'db, T: Record, S> {
    pub(crate) db: &'db Database,
    pub(crate) node: QueryNode,
    _state: PhantomData<fn() -> (T, S)>,
}

impl<'db, T: Record, S> Query<'db, T, S> {
    fn retag<S2>(self) -> Query<'db, T, S2> {
        Query { db: self.db, node: self.node, _state: PhantomData }
    }

    fn do_join<C: Record>(
        mut self,
        target_field: &'static str,
        kind: JoinKind,
    ) -> Result<Query<'db, T, Join<true>>, Error> {
        if self.node.joins.iter().any(|j| j.field == target_field) {
            return Err(QueryError::DuplicateJoin { field: target_field }.into());
        }
        if self.node.schema.child_collection(target_field).is_none() {
            return Err(QueryError::NotAChildCollection {
                form: self.node.schema.type_name,
                field: target_field,
            }
            .into());
        }
        let schema = C::schema();
        let (parent_key, child_key) = match &kind {
            JoinKind::Standard { parent_key, child_key } => (*parent_key, *child_key),
            JoinKind::Pivot { parent_key, child_key, .. } => (*parent_key, *child_key),
        };
        if self.node.schema.column(parent_key).is_none() {
            return Err(QueryError::UnknownColumn { form: self.node.schema.type_name, column: parent_key }.into());
        }
        if schema.column(child_key).is_none() {
            return Err(QueryError::UnknownColumn { form: schema.type_name, column: child_key }.into());
        }
        self.node.joins.push(JoinNode {
            field: target_field,
            schema,
            kind,
            order: Ordering::default(),
            limit: None,
            loader: Box::new(TypedChildLoader::<C>::new()),
        });
        self.node.focus = Some(self.node.joins.len() - 1);
        Ok(self.retag())
    }

    fn do_order(mut self, field: &'static str, dir: OrderDirection) -> Query<'db, T, S> {
        self.node.push_order(field, dir);
        self
    }

    fn do_limit(mut self, limit: u64, skip: u64) -> Query<'db, T, S> {
        self.node.set_limit(limit, skip);
        self
    }

    fn do_where(mut self, predicate: Expression) -> Result<Query<'db, T, S>, Error> {
        self.node.validate_expression(&predicate)?;
        self.node.predicate = Some(predicate);
        Ok(self)
    }
}

impl<'db, T: Record> Query<'db, T, TableState> {
    pub(crate) fn new(db: &'db Database) -> Self {
        Query { db, node: QueryNode::new(T::schema()), _state: PhantomData }
    }

    pub fn join<C: Record>(
        self,
        target_field: &'static str,
        parent_key: &'static str,
        child_key: &'static str,
    ) -> Result<Query<'db, T, Join<true>>, Error> {
        self.do_join::<C>(target_field, JoinKind::Standard { parent_key, child_key })
    }

    pub fn pivot_join<C: Record, P: Record>(
        self,
        target_field: &'static str,
        parent_key: &'static str,
        pivot_parent_key: &'static str,
        child_key: &'static str,
        pivot_child_key: &'static str,
    ) -> Result<Query<'db, T, Join<true>>, Error> {
        let pivot_table = P::schema().table_name;
        self.do_join::<C>(
            target_field,
            JoinKind::Pivot { pivot_table, pivot_parent_key, pivot_child_key, parent_key, child_key },
        )
    }

    pub fn order(self, field: &'static str, direction: OrderDirection) -> Query<'db, T, Order<false>> {
        self.do_order(field, direction).retag()
    }

    pub fn limit(self, limit: u64, skip: u64) -> Query<'db, T, Limit<false>> {
        self.do_limit(limit, skip).retag()
    }

    pub fn r#where(self, predicate: Expression) -> Result<Query<'db, T, Where<false>>, Error> {
        Ok(self.do_where(predicate)?.retag())
    }

    pub fn select(self) -> Result<Vec<T>, Error> {
        crate::materialize::run_select::<T>(self.db, &self.node)
    }

    pub fn count(self) -> Result<u64, Error> {
        crate::materialize::run_count(self.db, &self.node)
    }

    pub fn insert(self, rows: Vec<T>) -> Result<u64, Error> {
        crate::materialize::run_insert(self.db, &self.node, rows)
    }

    pub fn update(self, value: T, keys: UpdateKeys) -> Result<u64, Error> {
        crate::materialize::run_update(self.db, &self.node, &value, &keys)
    }

    pub fn delete(self) -> Result<u64, Error> {
        crate::materialize::run_delete(self.db, &self.node)
    }
}

impl<'db, T: Record, const J: bool> Query<'db, T, Join<J>> {
    pub fn join<C: Record>(
        self,
        target_field: &'static str,
        parent_key: &'static str,
        child_key: &'static str,
    ) -> Result<Query<'db, T, Join<true>>, Error> {
        self.do_join::<C>(target_field, JoinKind::Standard { parent_key, child_key })
    }

    pub fn pivot_join<C: Record, P: Record>(
        self,
        target_field: &'static str,
        parent_key: &'static str,
        pivot_parent_key: &'static str,
        child_key: &'static str,
        pivot_child_key: &'static str,
    ) -> Result<Query<'db, T, Join<true>>, Error> {
        let pivot_table = P::schema().table_name;
        self.do_join::<C>(
            target_field,
            JoinKind::Pivot { pivot_table, pivot_parent_key, pivot_child_key, parent_key, child_key },
        )
    }

    pub fn order(self, field: &'static str, direction: OrderDirection) -> Query<'db, T, Order<J>> {
        self.do_order(field, direction).retag()
    }

    pub fn limit(self, limit: u64, skip: u64) -> Query<'db, T, Limit<J>> {
        self.do_limit(limit, skip).retag()
    }

    pub fn r#where(self, predicate: Expression) -> Result<Query<'db, T, Where<J>>, Error> {
        Ok(self.do_where(predicate)?.retag())
    }

    pub fn select(self) -> Result<Vec<T>, Error> {
        crate::materialize::run_select::<T>(self.db, &self.node)
    }

    pub fn count(self) -> Result<u64, Error> {
        crate::materialize::run_count(self.db, &self.node)
    }
}

impl<'db, T: Record, const J: bool> Query<'db, T, Order<J>> {
    pub fn join<C: Record>(
        self,
        target_field: &'static str,
        parent_key: &'static str,
        child_key: &'static str,
    ) -> Result<Query<'db, T, Join<true>>, Error> {
        self.do_join::<C>(target_field, JoinKind::Standard { parent_key, child_key })
    }

    pub fn pivot_join<C: Record, P: Record>(
        self,
        target_field: &'static str,
        parent_key: &'static str,
        pivot_parent_key: &'static str,
        child_key: &'static str,
        pivot_child_key: &'static str,
    ) -> Result<Query<'db, T, Join<true>>, Error> {
        let pivot_table = P::schema().table_name;
        self.do_join::<C>(
            target_field,
            JoinKind::Pivot { pivot_table, pivot_parent_key, pivot_child_key, parent_key, child_key },
        )
    }

    pub fn order(self, field: &'static str, direction: OrderDirection) -> Query<'db, T, Order<J>> {
        self.do_order(field, direction)
    }

    pub fn limit(self, limit: u64, skip: u64) -> Query<'db, T, Limit<J>> {
        self.do_limit(limit, skip).retag()
    }

    pub fn r#where(self, predicate: Expression) -> Result<Query<'db, T, Where<J>>, Error> {
        Ok(self.do_where(predicate)?.retag())
    }

    pub fn select(self) -> Result<Vec<T>, Error> {
        crate::materialize::run_select::<T>(self.db, &self.node)
    }

    pub fn count(self) -> Result<u64, Error> {
        crate::materialize::run_count(self.db, &self.node)
    }
}

impl<'db, T: Record, const J: bool> Query<'db, T, Limit<J>> {
    pub fn join<C: Record>(
        self,
        target_field: &'static str,
        parent_key: &'static str,
        child_key: &'static str,
    ) -> Result<Query<'db, T, Join<true>>, Error> {
        self.do_join::<C>(target_field, JoinKind::Standard { parent_key, child_key })
    }

    pub fn pivot_join<C: Record, P: Record>(
        self,
        target_field: &'static str,
        parent_key: &'static str,
        pivot_parent_key: &'static str,
        child_key: &'static str,
        pivot_child_key: &'static str,
    ) -> Result<Query<'db, T, Join<true>>, Error> {
        let pivot_table = P::schema().table_name;
        self.do_join::<C>(
            target_field,
            JoinKind::Pivot { pivot_table, pivot_parent_key, pivot_child_key, parent_key, child_key },
        )
    }

    pub fn r#where(self, predicate: Expression) -> Result<Query<'db, T, Where<J>>, Error> {
        Ok(self.do_where(predicate)?.retag())
    }

    pub fn select(self) -> Result<Vec<T>, Error> {
        crate::materialize::run_select::<T>(self.db, &self.node)
    }

    pub fn count(self) -> Result<u64, Error> {
        crate::materialize::run_count(self.db, &self.node)
    }
}

impl<'db, T: Record> Query<'db, T, Where<false>> {
    pub fn select(self) -> Result<Vec<T>, Error> {
        crate::materialize::run_select::<T>(self.db, &self.node)
    }

    pub fn count(self) -> Result<u64, Error> {
        crate::materialize::run_count(self.db, &self.node)
    }

    pub fn update(self, value: T, keys: UpdateKeys) -> Result<u64, Error> {
        crate::materialize::run_update(self.db, &self.node, &value, &keys)
    }

    pub fn delete(self) -> Result<u64, Error> {
        crate::materialize::run_delete(self.db, &self.node)
    }
}

impl<'db, T: Record> Query<'db, T, Where<true>> {
    pub fn select(self) -> Result<Vec<T>, Error> {
        crate::materialize::run_select::<T>(self.db, &self.node)
    }

    pub fn count(self) -> Result<u64, Error> {
        crate::materialize::run_count(self.db, &self.node)
    }
}

/// Which columns an `update` writes. The primary key column is excluded
/// from the `SET` list under every variant.
#[derive(Debug, Clone)]
pub enum UpdateKeys {
    /// Every column except the primary key.
    All,
    /// Only these columns (field or column names).
    Set(Vec<&'static str>),
    /// Every column except the primary key and these.
    Ignore(Vec<&'static str>),
}
