use crate::constants::Pgno;

/// Page-number list kept in ascending order on demand.
///
/// Appends are cheap and mark the list unsorted; every query sorts first.
#[derive(Debug, Clone)]
pub(crate) struct Idl {
    ids: Vec<Pgno>,
    sorted: bool,
}

impl Default for Idl {
    fn default() -> Self {
        Idl::new()
    }
}

impl PartialEq for Idl {
    fn eq(&self, other: &Idl) -> bool {
        let (mut a, mut b) = (self.clone(), other.clone());
        a.as_slice() == b.as_slice()
    }
}

impl Eq for Idl {}

impl Idl {
    pub fn new() -> Self {
        Idl {
            ids: Vec::new(),
            sorted: true,
        }
    }

    pub fn from_vec(ids: Vec<Pgno>) -> Self {
        let mut idl = Idl { ids, sorted: false };
        idl.sort();
        idl
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Append an id without keeping order
    pub fn append(&mut self, id: Pgno) {
        if self.sorted {
            if let Some(&last) = self.ids.last() {
                self.sorted = last < id;
            }
        }
        self.ids.push(id);
    }

    /// Append a contiguous run of ids
    pub fn append_range(&mut self, first: Pgno, count: u64) {
        for id in first..first + count {
            self.append(id);
        }
    }

    /// Append all ids of another list
    pub fn append_list(&mut self, other: &Idl) {
        for &id in &other.ids {
            self.append(id);
        }
    }

    /// Sort the list in ascending order
    pub fn sort(&mut self) {
        if !self.sorted {
            self.ids.sort_unstable();
            self.ids.dedup();
            self.sorted = true;
        }
    }

    /// Remove and return the first id of `n` consecutive ids.
    ///
    /// A single id is taken from the top of the list.
    pub fn take_run(&mut self, n: usize) -> Option<Pgno> {
        if n == 0 || self.ids.len() < n {
            return None;
        }
        self.sort();
        if n == 1 {
            return self.ids.pop();
        }
        let mut start = 0;
        for i in 1..self.ids.len() {
            if self.ids[i] != self.ids[i - 1] + 1 {
                start = i;
            }
            if i + 1 - start == n {
                let first = self.ids[start];
                self.ids.drain(start..=i);
                return Some(first);
            }
        }
        None
    }

    pub fn as_slice(&mut self) -> &[Pgno] {
        self.sort();
        &self.ids
    }
}
