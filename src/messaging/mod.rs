// Module messaging - Note events, queues, notifications and the event bus

pub mod channels;
pub mod events;
pub mod note;
pub mod notification;
