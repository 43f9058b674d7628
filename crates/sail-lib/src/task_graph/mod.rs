mod visitor;

pub use visitor::{Error as VisitorError, Visitor};
