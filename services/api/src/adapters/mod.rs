pub mod db;
pub mod fcm;
pub mod twilio;

pub use db::DbAdapter;
pub use fcm::FcmPushChannel;
pub use twilio::{TwilioClient, TwilioSmsChannel, TwilioVoiceChannel};
