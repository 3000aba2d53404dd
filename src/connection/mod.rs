// Module connexion - Device status and reconnection back-off

pub mod reconnect;
pub mod status;
