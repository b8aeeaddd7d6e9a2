//! 本地与远端结果合并

use std::collections::HashSet;
use std::hash::Hash;

/// 保留全部本地结果，追加键值未出现过的远端结果
///
/// 远端结果之间的重复同样只保留第一条。
pub fn merge_by_key<T, K, F>(local: Vec<T>, remote: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen: HashSet<K> = local.iter().map(&key).collect();
    let mut merged = local;
    for item in remote {
        if seen.insert(key(&item)) {
            merged.push(item);
        }
    }
    merged
}
