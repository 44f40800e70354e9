use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
}

/// A transient message for the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Clone, Default)]
pub(crate) struct Notices(Rc<RefCell<VecDeque<Notice>>>);

impl Notices {
    pub(crate) fn success(&self, message: impl Into<String>) {
        self.push(NoticeLevel::Success, message.into());
    }

    pub(crate) fn error(&self, message: impl Into<String>) {
        self.push(NoticeLevel::Error, message.into());
    }

    fn push(&self, level: NoticeLevel, message: String) {
        self.0.borrow_mut().push_back(Notice { level, message });
    }

    pub(crate) fn drain(&self) -> Vec<Notice> {
        self.0.borrow_mut().drain(..).collect()
    }
}
