// sprints 数据源: 遍历看板, 再遍历每个看板的迭代
//
// 同一迭代可能挂在多个看板下, 按 id 去重。
// 不支持迭代的看板 (请求失败) 直接跳过。

use std::collections::{HashSet, VecDeque};

use log::{debug, warn};
use serde_json::Value as JsonValue;

use crate::query::progress::ProgressUpdate;
use crate::query::types::SchemaRow;
use crate::Result;

use super::tracker::{BoardRequest, SprintRequest};
use super::{
    reject_order_by_and_expand, take_where_params, Source, SourceContext, SourceFactory,
    PAGE_SIZE, UNLIMITED,
};

/// 每个看板的迭代分页大小
pub const SPRINT_PAGE_SIZE: u64 = 50;

const WHERE_SHAPE: &str = "Sprint query 'where' expressions should be a dictionary \
                           having any of the following keys: 'board_type', \
                           'board_name', or 'state'.";

/// 迭代
#[derive(Debug, Clone, Copy, Default)]
pub struct SprintsFactory;

impl SourceFactory for SprintsFactory {
    fn name(&self) -> &str {
        "sprints"
    }

    fn base_schema(&self) -> Vec<SchemaRow> {
        vec![
            SchemaRow::new("id", "int", None),
            SchemaRow::new("state", "str", None),
            SchemaRow::new("name", "str", None),
            SchemaRow::new("startDate", "datestr", None),
            SchemaRow::new("endDate", "datestr", None),
            SchemaRow::new("completeDate", "datestr", None),
            SchemaRow::new("originBoardId", "int", None),
        ]
    }

    fn open(&self, context: SourceContext) -> Result<Box<dyn Source>> {
        reject_order_by_and_expand(context.query(), "Sprint")?;
        let [board_type, board_name, state] = take_where_params(
            context.query().where_clause(),
            ["board_type", "board_name", "state"],
            WHERE_SHAPE,
        )?;
        Ok(Box::new(SprintSource::new(context, board_type, board_name, state)))
    }
}

/// 当前正在分页的看板
struct BoardCursor {
    board_id: i64,
    start_at: u64,
    is_last: bool,
}

/// 看板 × 迭代 两级分页
pub struct SprintSource {
    context: SourceContext,
    board_type: Option<String>,
    board_name: Option<String>,
    state: Option<String>,
    limit: u64,
    board_start: u64,
    board_total: u64,
    boards: VecDeque<JsonValue>,
    cursor: Option<BoardCursor>,
    sprints: VecDeque<JsonValue>,
    seen: HashSet<String>,
    count: u64,
    started: bool,
    done: bool,
}

impl SprintSource {
    fn new(
        context: SourceContext,
        board_type: Option<String>,
        board_name: Option<String>,
        state: Option<String>,
    ) -> Self {
        let limit = context.result_limit();
        Self {
            context,
            board_type,
            board_name,
            state,
            limit,
            board_start: 0,
            board_total: UNLIMITED,
            boards: VecDeque::new(),
            cursor: None,
            sprints: VecDeque::new(),
            seen: HashSet::new(),
            count: 0,
            started: false,
            done: false,
        }
    }

    /// 下一页迭代; 失败时放弃该看板
    fn fetch_sprints(&mut self) {
        let Some(cursor) = self.cursor.as_mut() else {
            return;
        };
        let request = SprintRequest {
            board_id: cursor.board_id,
            start_at: cursor.start_at,
            max_results: SPRINT_PAGE_SIZE,
            state: self.state.clone(),
        };
        match self.context.tracker().sprints(&request) {
            Ok(page) => {
                cursor.start_at += page.values.len() as u64;
                cursor.is_last = page.is_last || page.values.is_empty();
                self.sprints.extend(page.values);
            }
            Err(e) => {
                debug!("Skipping sprints of board {}: {}", cursor.board_id, e);
                self.cursor = None;
            }
        }
    }

    fn fetch_boards(&mut self) -> Result<()> {
        let request = BoardRequest {
            start_at: self.board_start,
            max_results: PAGE_SIZE,
            board_type: self.board_type.clone(),
            name: self.board_name.clone(),
        };
        let page = self.context.tracker().boards(&request)?;
        self.board_total = page.total;
        self.board_start += page.values.len() as u64;
        if page.values.is_empty() {
            self.board_total = self.board_start;
        }
        self.boards.extend(page.values);
        Ok(())
    }
}

fn sprint_id(sprint: &JsonValue) -> String {
    match sprint.get("id") {
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

impl Iterator for SprintSource {
    type Item = Result<JsonValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            self.started = true;
            self.context
                .update_progress(ProgressUpdate::default().completed(0).total(1).visible(true));
        }

        loop {
            if self.done {
                return None;
            }

            if let Some(sprint) = self.sprints.pop_front() {
                if !self.seen.insert(sprint_id(&sprint)) {
                    continue;
                }
                self.count += 1;
                self.context.update_count(self.count);
                if self.count >= self.limit {
                    self.done = true;
                }
                return Some(Ok(sprint));
            }

            match self.cursor.as_ref().map(|cursor| cursor.is_last) {
                Some(false) => {
                    self.fetch_sprints();
                    continue;
                }
                Some(true) => self.cursor = None,
                None => {}
            }

            if let Some(board) = self.boards.pop_front() {
                self.context
                    .update_progress(ProgressUpdate::advance(1).total(self.board_total).visible(true));
                match board.get("id").and_then(JsonValue::as_i64) {
                    Some(board_id) => {
                        self.cursor = Some(BoardCursor {
                            board_id,
                            start_at: 0,
                            is_last: false,
                        })
                    }
                    None => warn!("Board without numeric id skipped: {}", board),
                }
                continue;
            }

            if self.board_start >= self.board_total {
                if self.count == 0 {
                    self.context.update_count(0);
                }
                self.done = true;
                return None;
            }

            if let Err(e) = self.fetch_boards() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

impl Source for SprintSource {
    fn context(&self) -> &SourceContext {
        &self.context
    }
}
