pub mod import;
pub use import::ImportService;

pub mod logs;
pub use logs::LogRing;

pub mod matcher;
pub use matcher::SeasonMatcher;

pub mod metadata;
pub use metadata::MetadataService;

pub mod notify;
pub use notify::Notifier;

pub mod wanted;
pub use wanted::WantedService;
