/// Attributes of an assertion, in document order.
///
/// A name maps to every value it was given; names keep the order in which they
/// first appeared.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Attributes {
    entries: Vec<(String, Vec<String>)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends values, creating the attribute when it is new.
    pub fn add(&mut self, name: &str, values: impl IntoIterator<Item = String>) {
        match self.position(name) {
            Some(index) => self.entries[index].1.extend(values),
            None => self
                .entries
                .push((name.to_string(), values.into_iter().collect())),
        }
    }

    pub fn set(&mut self, name: &str, values: Vec<String>) {
        match self.position(name) {
            Some(index) => self.entries[index].1 = values,
            None => self.entries.push((name.to_string(), values)),
        }
    }

    /// First value of the attribute.
    pub fn single(&self, name: &str) -> Option<&str> {
        self.multi(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn multi(&self, name: &str) -> Option<&[String]> {
        self.position(name)
            .map(|index| self.entries[index].1.as_slice())
    }

    /// First attribute whose name satisfies `predicate`.
    pub fn fetch(&self, predicate: impl Fn(&str) -> bool) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(name, _)| predicate(name))
            .map(|(_, values)| values.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(entry, _)| entry == name)
    }
}
