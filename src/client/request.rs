use super::ids::IdLease;

use std::collections::HashMap;

/// One responder request, holding its request id until it is handled or dropped.
#[derive(Debug)]
pub struct Request {
    id: IdLease,
    pub params: HashMap<String, String>,
    pub content: Vec<u8>,
}

impl Request {
    pub(crate) fn new(id: IdLease) -> Request {
        Request {
            id,
            params: HashMap::new(),
            content: Vec::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id.get()
    }

    pub fn set_param<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) -> &mut Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn clear_param(&mut self, name: &str) -> &mut Self {
        self.params.remove(name);
        self
    }

    pub fn set_content<B: Into<Vec<u8>>>(&mut self, content: B) -> &mut Self {
        self.content = content.into();
        self
    }
}
