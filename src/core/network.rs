use crate::types::{Epoch, ExcludedPair, ExclusionReason, InsarError, InsarResult, PairMeta};
use chrono::NaiveDate;
use nalgebra::DMatrix;
use std::collections::{BTreeMap, HashSet};

/// Sorted set of unique acquisition dates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochSet {
    dates: Vec<NaiveDate>,
}

impl EpochSet {
    /// Collect the unique epochs referenced by a set of pairs
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a PairMeta>) -> Self {
        let mut dates: Vec<NaiveDate> = pairs
            .into_iter()
            .flat_map(|p| [p.first, p.second])
            .collect();
        dates.sort();
        dates.dedup();
        Self { dates }
    }

    pub fn from_dates(mut dates: Vec<NaiveDate>) -> Self {
        dates.sort();
        dates.dedup();
        Self { dates }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn epoch(&self, index: usize) -> Option<Epoch> {
        self.dates.get(index).map(|&date| Epoch { date, index })
    }

    pub fn index_of(&self, date: NaiveDate) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// Epoch times in years relative to epoch `origin`
    pub fn years_since(&self, origin: usize) -> Vec<f64> {
        let t0 = self.dates[origin];
        self.dates
            .iter()
            .map(|d| (*d - t0).num_days() as f64 / crate::types::DAYS_PER_YEAR)
            .collect()
    }
}

/// Disjoint-set forest over epoch indices
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Merge the sets of `a` and `b`; false if they were already joined
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }
}

/// Pair as an edge between two epochs of the effective network
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkEdge {
    /// Index of the pair in the run's pair list
    pub pair_index: usize,
    /// Epoch index of the first (master) acquisition
    pub first: usize,
    /// Epoch index of the second (slave) acquisition
    pub second: usize,
    /// Temporal baseline in years
    pub time_span: f64,
}

/// Effective interferogram network: the component that contains the reference epoch
#[derive(Debug, Clone)]
pub struct NetworkGraph {
    epochs: EpochSet,
    reference: usize,
    edges: Vec<NetworkEdge>,
    excluded: Vec<ExcludedPair>,
    total_pairs: usize,
}

impl NetworkGraph {
    /// Epochs of the effective network
    pub fn epochs(&self) -> &EpochSet {
        &self.epochs
    }

    /// Index of the zero-displacement epoch in [`Self::epochs`]
    pub fn reference_epoch(&self) -> usize {
        self.reference
    }

    pub fn reference_date(&self) -> NaiveDate {
        self.epochs.dates()[self.reference]
    }

    /// Included pairs, in pair-list order
    pub fn edges(&self) -> &[NetworkEdge] {
        &self.edges
    }

    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn excluded(&self) -> &[ExcludedPair] {
        &self.excluded
    }

    pub fn total_pairs(&self) -> usize {
        self.total_pairs
    }

    /// Position of a pair among the included edges
    pub fn edge_of_pair(&self, pair_index: usize) -> Option<usize> {
        self.edges
            .binary_search_by_key(&pair_index, |e| e.pair_index)
            .ok()
    }

    pub fn is_included(&self, pair_index: usize) -> bool {
        self.edge_of_pair(pair_index).is_some()
    }

    /// Time of every epoch in years relative to the reference epoch
    pub fn epoch_years(&self) -> Vec<f64> {
        self.epochs.years_since(self.reference)
    }

    /// Kruskal spanning forest over the edges flagged in `valid`.
    ///
    /// Edges are taken in increasing weight, ties broken by edge order, so the
    /// result only depends on the weights and the valid set. Returns edge
    /// positions (not pair indices) in ascending order.
    pub fn minimum_spanning_forest(&self, weights: &[f64], valid: &[bool]) -> Vec<usize> {
        let mut candidates: Vec<usize> = (0..self.edges.len()).filter(|&e| valid[e]).collect();
        candidates.sort_by(|&a, &b| weights[a].total_cmp(&weights[b]).then(a.cmp(&b)));

        let mut forest = UnionFind::new(self.epochs.len());
        let mut selected: Vec<usize> = candidates
            .into_iter()
            .filter(|&e| forest.union(self.edges[e].first, self.edges[e].second))
            .collect();
        selected.sort_unstable();
        selected
    }
}

/// Builds the effective network from pair metadata
#[derive(Debug, Clone, Default)]
pub struct NetworkBuilder {
    reference_epoch: Option<NaiveDate>,
}

impl NetworkBuilder {
    pub fn new(reference_epoch: Option<NaiveDate>) -> Self {
        Self { reference_epoch }
    }

    /// Build the network, treating `pre_excluded` pairs as unavailable.
    ///
    /// Pairs outside the component of the reference epoch (or the largest
    /// component when no reference is pinned) are reported as
    /// [`ExclusionReason::Disconnected`].
    pub fn build(
        &self,
        pairs: &[PairMeta],
        pre_excluded: &[ExcludedPair],
    ) -> InsarResult<NetworkGraph> {
        log::info!("Building interferogram network from {} pairs", pairs.len());

        if pairs.is_empty() {
            return Err(InsarError::InvalidInput("No interferometric pairs supplied".to_string()));
        }
        for pair in pairs {
            if pair.first == pair.second {
                return Err(InsarError::InvalidInput(format!(
                    "Pair {} has identical epochs ({})",
                    pair.id, pair.first
                )));
            }
        }

        let all_epochs = EpochSet::from_pairs(pairs);
        if let Some(reference) = self.reference_epoch {
            if all_epochs.index_of(reference).is_none() {
                return Err(InsarError::InvalidConfig(format!(
                    "Reference epoch {} is not an epoch of any pair",
                    reference
                )));
            }
        }

        let pre_excluded_set: HashSet<usize> = pre_excluded.iter().map(|e| e.pair_index).collect();
        let available: Vec<usize> = (0..pairs.len())
            .filter(|i| !pre_excluded_set.contains(i))
            .collect();

        let mut components = UnionFind::new(all_epochs.len());
        for &i in &available {
            let a = all_epochs.index_of(pairs[i].first).unwrap_or_default();
            let b = all_epochs.index_of(pairs[i].second).unwrap_or_default();
            components.union(a, b);
        }

        // Epoch membership per component root, ordered by root for determinism
        let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for epoch in 0..all_epochs.len() {
            members.entry(components.find(epoch)).or_default().push(epoch);
        }

        let chosen_root = match self.reference_epoch.and_then(|d| all_epochs.index_of(d)) {
            Some(reference) => components.find(reference),
            None => {
                // Largest component; ties go to the one holding the earliest epoch
                let mut best: Option<(usize, usize, usize)> = None;
                for (&root, epochs) in &members {
                    let has_pairs = available.iter().any(|&i| {
                        all_epochs
                            .index_of(pairs[i].first)
                            .map(|e| components.find(e) == root)
                            .unwrap_or(false)
                    });
                    if !has_pairs {
                        continue;
                    }
                    let size = epochs.len();
                    let earliest = epochs[0];
                    let better = match best {
                        None => true,
                        Some((_, best_size, best_earliest)) => {
                            size > best_size || (size == best_size && earliest < best_earliest)
                        }
                    };
                    if better {
                        best = Some((root, size, earliest));
                    }
                }
                match best {
                    Some((root, _, _)) => root,
                    None => {
                        let excluded: Vec<String> = pre_excluded.iter().map(|e| e.id.clone()).collect();
                        return Err(InsarError::DisconnectedNetwork {
                            reference: "<none>".to_string(),
                            component_epochs: 0,
                            excluded,
                        });
                    }
                }
            }
        };

        let component_epochs: Vec<usize> = members.get(&chosen_root).cloned().unwrap_or_default();
        let epochs = EpochSet::from_dates(
            component_epochs.iter().map(|&e| all_epochs.dates()[e]).collect(),
        );
        let reference_date = self
            .reference_epoch
            .unwrap_or_else(|| all_epochs.dates()[component_epochs[0]]);

        let mut excluded: Vec<ExcludedPair> = pre_excluded.to_vec();
        let mut edges = Vec::with_capacity(available.len());
        for &i in &available {
            let pair = &pairs[i];
            match (epochs.index_of(pair.first), epochs.index_of(pair.second)) {
                (Some(first), Some(second)) => edges.push(NetworkEdge {
                    pair_index: i,
                    first,
                    second,
                    time_span: pair.time_span(),
                }),
                _ => excluded.push(ExcludedPair {
                    pair_index: i,
                    id: pair.id.clone(),
                    reason: ExclusionReason::Disconnected,
                }),
            }
        }
        excluded.sort_by_key(|e| e.pair_index);

        if epochs.len() < 2 {
            return Err(InsarError::DisconnectedNetwork {
                reference: reference_date.to_string(),
                component_epochs: epochs.len(),
                excluded: excluded.iter().map(|e| e.id.clone()).collect(),
            });
        }

        let disconnected: Vec<&str> = excluded
            .iter()
            .filter(|e| e.reason == ExclusionReason::Disconnected)
            .map(|e| e.id.as_str())
            .collect();
        if !disconnected.is_empty() {
            log::warn!(
                "Network reduced to {} of {} epochs; {} disconnected pair(s) excluded: {:?}",
                epochs.len(),
                all_epochs.len(),
                disconnected.len(),
                disconnected
            );
        }

        let reference = epochs.index_of(reference_date).unwrap_or_default();
        log::info!(
            "Effective network: {} epochs, {} pairs, reference epoch {}",
            epochs.len(),
            edges.len(),
            reference_date
        );

        Ok(NetworkGraph {
            epochs,
            reference,
            edges,
            excluded,
            total_pairs: pairs.len(),
        })
    }
}

/// Pair-to-epoch design matrix of the effective network.
///
/// One row per included pair (`+1` at the second epoch, `-1` at the first),
/// one column per epoch except the reference, which is fixed at zero.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    matrix: DMatrix<f64>,
    columns: Vec<Option<usize>>,
    reference: usize,
}

impl DesignMatrix {
    pub fn from_network(network: &NetworkGraph) -> Self {
        let n_epochs = network.epochs().len();
        let reference = network.reference_epoch();
        let columns: Vec<Option<usize>> = (0..n_epochs)
            .map(|e| match e.cmp(&reference) {
                std::cmp::Ordering::Less => Some(e),
                std::cmp::Ordering::Equal => None,
                std::cmp::Ordering::Greater => Some(e - 1),
            })
            .collect();

        let mut matrix = DMatrix::zeros(network.n_edges(), n_epochs - 1);
        for (row, edge) in network.edges().iter().enumerate() {
            if let Some(col) = columns[edge.second] {
                matrix[(row, col)] += 1.0;
            }
            if let Some(col) = columns[edge.first] {
                matrix[(row, col)] -= 1.0;
            }
        }

        Self {
            matrix,
            columns,
            reference,
        }
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn n_rows(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of unknowns (epochs minus the reference)
    pub fn n_unknowns(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn reference_epoch(&self) -> usize {
        self.reference
    }

    /// Unknown column of an epoch; `None` for the reference epoch
    pub fn column_of(&self, epoch: usize) -> Option<usize> {
        self.columns.get(epoch).copied().flatten()
    }

    /// Epoch index of an unknown column
    pub fn epoch_of_column(&self, column: usize) -> usize {
        if column < self.reference {
            column
        } else {
            column + 1
        }
    }

    /// Rows of the design matrix selected by `rows`
    pub fn restricted(&self, rows: &[usize]) -> DMatrix<f64> {
        self.matrix.select_rows(rows.iter())
    }
}

/// Bit set over network edges, used as a key for per-pixel system caches
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairMask {
    words: Vec<u64>,
    count: usize,
}

impl PairMask {
    pub fn from_flags(flags: &[bool]) -> Self {
        let mut words = vec![0u64; flags.len().div_ceil(64)];
        let mut count = 0;
        for (i, &f) in flags.iter().enumerate() {
            if f {
                words[i / 64] |= 1 << (i % 64);
                count += 1;
            }
        }
        Self { words, count }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn contains(&self, edge: usize) -> bool {
        self.words
            .get(edge / 64)
            .map(|w| w & (1 << (edge % 64)) != 0)
            .unwrap_or(false)
    }

    /// Indices of set edges in ascending order
    pub fn indices(&self) -> Vec<usize> {
        (0..self.words.len() * 64).filter(|&i| self.contains(i)).collect()
    }
}
