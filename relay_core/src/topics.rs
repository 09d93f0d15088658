//! MQTT subject layout for one node.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// `data/{location}/sensors/{node}`
    pub data: String,
    /// `ctl/{location}/thi`, shared by every node of the location
    pub control_group: String,
    /// `ctl/{location}/thi/{node}`
    pub control_node: String,
    /// `log/{location}/thi/{node}`
    pub status: String,
}

impl Topics {
    pub fn new(location: &str, node: &str) -> Self {
        Self {
            data: format!("data/{location}/sensors/{node}"),
            control_group: format!("ctl/{location}/thi"),
            control_node: format!("ctl/{location}/thi/{node}"),
            status: format!("log/{location}/thi/{node}"),
        }
    }
}
