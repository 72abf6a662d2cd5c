pub mod consume_errors;
pub mod consume_logs;
pub mod request_details;

pub use consume_errors::Entity as ConsumeErrors;
pub use consume_logs::Entity as ConsumeLogs;
pub use request_details::Entity as RequestDetails;
