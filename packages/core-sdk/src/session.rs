use std::sync::RwLock;

use crate::models::Turn;

/**
 * \brief 进程内唯一会话：只追加的消息记录与当前选中模型。
 *
 * 追加经由写锁串行化；并发的两次转发之间的交错顺序不作保证。
 */
#[derive(Debug)]
pub struct ConversationSession {
    turns: RwLock<Vec<Turn>>,
    selected_model: RwLock<String>,
}

impl ConversationSession {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            turns: RwLock::new(Vec::new()),
            selected_model: RwLock::new(default_model.into()),
        }
    }

    pub fn append(&self, turn: Turn) {
        let mut turns = self.turns.write().unwrap_or_else(|e| e.into_inner());
        turns.push(turn);
    }

    /** \brief 全部消息的快照。 */
    pub fn turns(&self) -> Vec<Turn> {
        self.turns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /** \brief 最近 n 条消息，按时间顺序。 */
    pub fn recent(&self, n: usize) -> Vec<Turn> {
        let turns = self.turns.read().unwrap_or_else(|e| e.into_inner());
        let start = turns.len().saturating_sub(n);
        turns[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.turns.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn selected_model(&self) -> String {
        self.selected_model
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn select_model(&self, model: &str) {
        let mut selected = self
            .selected_model
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if *selected != model {
            *selected = model.to_string();
        }
    }

    /**
     * \brief 实际生效的模型：当前选择可用则用之，否则取第一个可用模型。只读，不回写。
     */
    pub fn effective_model(&self, available: &[String]) -> String {
        let selected = self.selected_model();
        if available.iter().any(|m| *m == selected) {
            return selected;
        }
        available.first().cloned().unwrap_or(selected)
    }
}
