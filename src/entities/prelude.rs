pub use super::configs::Entity as Configs;
pub use super::root_folders::Entity as RootFolders;
pub use super::seasons::Entity as Seasons;
pub use super::series::Entity as Series;
