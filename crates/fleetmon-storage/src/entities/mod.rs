pub mod alert_rule;
pub mod cron;
pub mod ddns_profile;
pub mod nat;
pub mod notification;
pub mod notification_group;
pub mod notification_group_notification;
pub mod server;
pub mod server_group;
pub mod server_group_server;
pub mod service;
pub mod service_history;
pub mod transfer;
pub mod user;
pub mod waf;
