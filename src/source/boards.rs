// boards 数据源: 看板列表

use crate::query::types::SchemaRow;
use crate::Result;

use super::tracker::{BoardRequest, IssueTracker};
use super::{reject_order_by_and_expand, take_where_params, PagedSource, Source, SourceContext, SourceFactory};

const WHERE_SHAPE: &str = "Board query 'where' expressions should be a dictionary \
                           having any of the following keys: 'type' or 'name'";

/// 看板
#[derive(Debug, Clone, Copy, Default)]
pub struct BoardsFactory;

impl SourceFactory for BoardsFactory {
    fn name(&self) -> &str {
        "boards"
    }

    fn base_schema(&self) -> Vec<SchemaRow> {
        vec![
            SchemaRow::new("id", "int", None),
            SchemaRow::new("name", "str", None),
            SchemaRow::new("type", "str", None),
        ]
    }

    fn open(&self, context: SourceContext) -> Result<Box<dyn Source>> {
        reject_order_by_and_expand(context.query(), "Board")?;
        let [board_type, name] =
            take_where_params(context.query().where_clause(), ["type", "name"], WHERE_SHAPE)?;

        let fetch = Box::new(move |tracker: &dyn IssueTracker, start_at: u64, max_results: u64| {
            tracker.boards(&BoardRequest {
                start_at,
                max_results,
                board_type: board_type.clone(),
                name: name.clone(),
            })
        });
        Ok(Box::new(PagedSource::new(context, fetch)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::channel::Parameters;
    use crate::source::test_support::context;
    use crate::source::tracker::StaticTracker;
    use crate::SelectError;
    use serde_json::json;
    use std::sync::Arc;

    fn tracker() -> Arc<StaticTracker> {
        Arc::new(StaticTracker::new("test").with_boards(vec![
            json!({"id": 1, "name": "Alpha", "type": "scrum"}),
            json!({"id": 2, "name": "Beta", "type": "kanban"}),
            json!({"id": 3, "name": "Gamma", "type": "scrum"}),
        ]))
    }

    #[test]
    fn test_filters_by_type() {
        let (ctx, _, channel) = context(
            "select: [name]\nfrom: boards\nwhere:\n  type: scrum\n",
            tracker(),
            Parameters::new(),
        );
        let rows: Vec<_> = BoardsFactory.open(ctx).unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(channel.get(), 2);
    }

    #[test]
    fn test_rejects_unsupported_clauses() {
        let (ctx, _, _) = context(
            "select: [name]\nfrom: boards\norder_by: [name]\n",
            tracker(),
            Parameters::new(),
        );
        match BoardsFactory.open(ctx) {
            Err(SelectError::Query(msg)) => assert!(msg.contains("Use 'sort_by' instead")),
            _ => panic!("order_by should be rejected"),
        }

        let (ctx, _, _) = context(
            "select: [name]\nfrom: boards\nwhere:\n  - type = scrum\n",
            tracker(),
            Parameters::new(),
        );
        assert!(matches!(BoardsFactory.open(ctx), Err(SelectError::Query(_))));

        let (ctx, _, _) = context(
            "select: [name]\nfrom: boards\nwhere:\n  owner: me\n",
            tracker(),
            Parameters::new(),
        );
        match BoardsFactory.open(ctx) {
            Err(SelectError::Query(msg)) => assert!(msg.starts_with("Unexpected 'where' parameters")),
            _ => panic!("unknown where key should be rejected"),
        }
    }
}
