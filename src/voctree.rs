//! Hierarchical k-means vocabulary tree and the tf-idf view index built
//! over the scene database.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::ConfigurationError;
use crate::database::SceneDatabase;
use crate::io::object_from_json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub center: Vec<f32>,
    pub children: Vec<usize>,
    /// Set on leaves only.
    pub word: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularyTree {
    /// `nodes[0]` is the root, its center is unused.
    pub nodes: Vec<TreeNode>,
    pub num_words: usize,
}

fn distance2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest(centers: &[Vec<f32>], desc: &[f32]) -> usize {
    let mut best = (0, f32::INFINITY);
    for (i, c) in centers.iter().enumerate() {
        let d = distance2(c, desc);
        if d < best.1 {
            best = (i, d);
        }
    }
    best.0
}

fn kmeans(data: &[&[f32]], k: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<usize>> {
    let mut centers: Vec<Vec<f32>> = Vec::with_capacity(k);
    centers.push(data[rng.random_range(0..data.len())].to_vec());
    // k-means++ seeding
    while centers.len() < k {
        let d: Vec<f32> = data
            .iter()
            .map(|x| centers.iter().map(|c| distance2(c, x)).fold(f32::INFINITY, f32::min))
            .collect();
        let total: f32 = d.iter().sum();
        if total <= 0.0 {
            break;
        }
        let mut target = rng.random_range(0.0..total);
        let mut pick = data.len() - 1;
        for (i, di) in d.iter().enumerate() {
            if target < *di {
                pick = i;
                break;
            }
            target -= di;
        }
        centers.push(data[pick].to_vec());
    }

    let dim = data[0].len();
    let mut assignment = vec![0usize; data.len()];
    for _ in 0..15 {
        let next: Vec<usize> = data.iter().map(|x| nearest(&centers, x)).collect();
        let changed = next != assignment;
        assignment = next;
        let mut sums = vec![vec![0.0f32; dim]; centers.len()];
        let mut counts = vec![0usize; centers.len()];
        for (x, &a) in data.iter().zip(&assignment) {
            counts[a] += 1;
            sums[a].iter_mut().zip(x.iter()).for_each(|(s, v)| *s += v);
        }
        for (c, (sum, n)) in centers.iter_mut().zip(sums.into_iter().zip(counts)) {
            if n > 0 {
                *c = sum.into_iter().map(|s| s / n as f32).collect();
            }
        }
        if !changed {
            break;
        }
    }
    let mut clusters = vec![Vec::new(); centers.len()];
    for (i, &a) in assignment.iter().enumerate() {
        clusters[a].push(i);
    }
    clusters.retain(|c| !c.is_empty());
    clusters
}

impl VocabularyTree {
    /// Trains a tree with at most `branching^depth` words.
    pub fn train(descriptors: &[&[f32]], branching: usize, depth: usize, seed: u64) -> VocabularyTree {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut tree = VocabularyTree {
            nodes: vec![TreeNode {
                center: Vec::new(),
                children: Vec::new(),
                word: None,
            }],
            num_words: 0,
        };
        let all: Vec<usize> = (0..descriptors.len()).collect();
        tree.split(0, descriptors, &all, branching.max(2), depth, &mut rng);
        tree
    }

    fn split(
        &mut self,
        node: usize,
        descriptors: &[&[f32]],
        members: &[usize],
        branching: usize,
        depth: usize,
        rng: &mut ChaCha8Rng,
    ) {
        if depth == 0 || members.len() <= 1 {
            self.nodes[node].word = Some(self.num_words as u32);
            self.num_words += 1;
            return;
        }
        let data: Vec<&[f32]> = members.iter().map(|&i| descriptors[i]).collect();
        let clusters = kmeans(&data, branching.min(members.len()), rng);
        if clusters.len() <= 1 {
            self.nodes[node].word = Some(self.num_words as u32);
            self.num_words += 1;
            return;
        }
        for cluster in clusters {
            let dim = data[0].len();
            let mut center = vec![0.0f32; dim];
            for &i in &cluster {
                center.iter_mut().zip(data[i]).for_each(|(c, v)| *c += v);
            }
            center.iter_mut().for_each(|c| *c /= cluster.len() as f32);
            let child = self.nodes.len();
            self.nodes.push(TreeNode {
                center,
                children: Vec::new(),
                word: None,
            });
            self.nodes[node].children.push(child);
            let child_members: Vec<usize> = cluster.iter().map(|&i| members[i]).collect();
            self.split(child, descriptors, &child_members, branching, depth - 1, rng);
        }
    }

    pub fn load(path: &Path) -> Result<VocabularyTree, ConfigurationError> {
        if !path.exists() {
            return Err(ConfigurationError::NotFound {
                what: "vocabulary tree",
                path: path.to_path_buf(),
            });
        }
        let tree: VocabularyTree = object_from_json(path)?;
        tree.validate()?;
        Ok(tree)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: String| Err(ConfigurationError::InvalidVocabulary(reason));
        if self.nodes.is_empty() || self.num_words == 0 {
            return invalid("empty tree".to_string());
        }
        let dim = self.descriptor_len();
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 && node.center.len() != dim {
                return invalid(format!("node {} has dimension {}", i, node.center.len()));
            }
            if node.children.iter().any(|&c| c <= i || c >= self.nodes.len()) {
                return invalid(format!("node {} has an invalid child", i));
            }
            match node.word {
                Some(w) if w as usize >= self.num_words => {
                    return invalid(format!("node {} has word {} out of range", i, w));
                }
                None if node.children.is_empty() => {
                    return invalid(format!("leaf {} has no word", i));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn descriptor_len(&self) -> usize {
        self.nodes.get(1).map_or(0, |n| n.center.len())
    }

    pub fn quantize(&self, desc: &[f32]) -> u32 {
        let mut node = 0;
        loop {
            let n = &self.nodes[node];
            if n.children.is_empty() {
                return n.word.unwrap_or(0);
            }
            let mut best = (n.children[0], f32::INFINITY);
            for &c in &n.children {
                let d = distance2(&self.nodes[c].center, desc);
                if d < best.1 {
                    best = (c, d);
                }
            }
            node = best.0;
        }
    }
}

/// Candidate database view ranked by visual similarity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewMatch {
    pub view_index: usize,
    pub score: f32,
}

type BowVector = BTreeMap<u32, f32>;

pub struct ViewIndex {
    tree: VocabularyTree,
    idf: Vec<f32>,
    views: Vec<BowVector>,
    inverted: HashMap<u32, Vec<usize>>,
}

impl ViewIndex {
    /// Indexes every database view. Without explicit weights the idf is
    /// computed from the database itself.
    pub fn build(
        tree: VocabularyTree,
        weights: Option<Vec<f32>>,
        database: &SceneDatabase,
    ) -> Result<ViewIndex, ConfigurationError> {
        if database.descriptor_len() != 0 && tree.descriptor_len() != database.descriptor_len() {
            return Err(ConfigurationError::InvalidVocabulary(format!(
                "tree descriptors have length {}, database descriptors {}",
                tree.descriptor_len(),
                database.descriptor_len()
            )));
        }
        let view_words: Vec<Vec<u32>> = database
            .views()
            .par_iter()
            .map(|v| v.features.iter().map(|f| tree.quantize(&f.descriptor)).collect())
            .collect();
        let idf = match weights {
            Some(w) if w.len() == tree.num_words => w,
            Some(w) => {
                return Err(ConfigurationError::InvalidVocabulary(format!(
                    "{} weights for {} words",
                    w.len(),
                    tree.num_words
                )));
            }
            None => {
                let mut df = vec![0usize; tree.num_words];
                for words in &view_words {
                    let mut unique = words.clone();
                    unique.sort_unstable();
                    unique.dedup();
                    unique.iter().for_each(|&w| df[w as usize] += 1);
                }
                let n = view_words.len().max(1) as f32;
                df.iter()
                    .map(|&d| if d == 0 { 0.0 } else { (n / d as f32).ln() + 1e-3 })
                    .collect()
            }
        };
        let mut index = ViewIndex {
            tree,
            idf,
            views: Vec::new(),
            inverted: HashMap::new(),
        };
        index.views = view_words.iter().map(|w| index.bow(w)).collect();
        for (view, bow) in index.views.iter().enumerate() {
            for &word in bow.keys() {
                index.inverted.entry(word).or_default().push(view);
            }
        }
        log::debug!(
            "view index: {} views, {} words",
            index.views.len(),
            index.tree.num_words
        );
        Ok(index)
    }

    pub fn load_weights(path: &Path) -> Result<Vec<f32>, ConfigurationError> {
        if !path.exists() {
            return Err(ConfigurationError::NotFound {
                what: "vocabulary weights",
                path: path.to_path_buf(),
            });
        }
        object_from_json(path)
    }

    /// L1 normalized tf-idf vector.
    fn bow(&self, words: &[u32]) -> BowVector {
        let mut v = BowVector::new();
        for &w in words {
            *v.entry(w).or_insert(0.0) += self.idf.get(w as usize).copied().unwrap_or(0.0);
        }
        let total: f32 = v.values().sum();
        if total > 0.0 {
            v.values_mut().for_each(|x| *x /= total);
        }
        v.retain(|_, x| *x > 0.0);
        v
    }

    pub fn tree(&self) -> &VocabularyTree {
        &self.tree
    }

    /// Up to `max_views` views sharing words with the query, best first.
    pub fn query(&self, descriptors: &[Vec<f32>], max_views: usize) -> Vec<ViewMatch> {
        let words: Vec<u32> = descriptors.par_iter().map(|d| self.tree.quantize(d)).collect();
        let query = self.bow(&words);
        let mut scores: HashMap<usize, f32> = HashMap::new();
        for (word, qw) in &query {
            for &view in self.inverted.get(word).into_iter().flatten() {
                let dw = self.views[view].get(word).copied().unwrap_or(0.0);
                *scores.entry(view).or_insert(0.0) += qw.min(dw);
            }
        }
        let mut ranked: Vec<ViewMatch> = scores
            .into_iter()
            .filter(|(_, s)| *s > 0.0)
            .map(|(view_index, score)| ViewMatch { view_index, score })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.view_index.cmp(&b.view_index)));
        ranked.truncate(max_views);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clustered(seed: u64) -> Vec<Vec<f32>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let centers = [[0.0f32, 0.0], [10.0, 0.0], [0.0, 10.0], [10.0, 10.0]];
        (0..80)
            .map(|i| {
                let c = centers[i % 4];
                vec![c[0] + rng.random_range(-0.5..0.5), c[1] + rng.random_range(-0.5..0.5)]
            })
            .collect()
    }

    #[test]
    fn separated_clusters_get_distinct_words() {
        let data = clustered(1);
        let refs: Vec<&[f32]> = data.iter().map(|d| d.as_slice()).collect();
        let tree = VocabularyTree::train(&refs, 4, 1, 7);
        tree.validate().unwrap();
        assert_eq!(tree.num_words, 4);
        let words: Vec<u32> = [[0.1f32, 0.2], [9.9, 0.1], [0.2, 9.8], [10.1, 9.9]]
            .iter()
            .map(|d| tree.quantize(d))
            .collect();
        let mut unique = words.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 4);
        assert_eq!(tree.quantize(&[0.3, -0.1]), words[0]);
    }

    #[test]
    fn training_is_deterministic() {
        let data = clustered(3);
        let refs: Vec<&[f32]> = data.iter().map(|d| d.as_slice()).collect();
        assert_eq!(
            VocabularyTree::train(&refs, 3, 2, 11),
            VocabularyTree::train(&refs, 3, 2, 11)
        );
    }
}
