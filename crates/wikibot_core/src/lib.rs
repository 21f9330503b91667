pub mod api;
pub mod bot;
pub mod cache;
pub mod category;
pub mod citoid;
pub mod config;
pub mod error;
pub mod family;
pub mod flow;
pub mod http;
pub mod logentries;
pub mod login;
pub mod namespace;
pub mod page;
pub mod site;
pub mod superset;
pub mod textlib;
pub mod title;
pub mod upload;

#[cfg(test)]
mod testing;

pub use error::{Result, WikiError};
pub use page::Page;
pub use site::Site;
pub use title::Title;
